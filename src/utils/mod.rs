pub mod archive;

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tempfile::{Builder as TempFileBuilder, TempDir};
use walkdir::WalkDir;

/// Human-readable byte count, e.g. `12.3 MB`.
pub fn display_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["bytes", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} bytes", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Creates a private working directory under `temp_root`, removed on drop.
pub fn request_dir(temp_root: &Path, prefix: &str) -> Result<TempDir> {
    fs::create_dir_all(temp_root)
        .with_context(|| format!("Failed to create temp root: {}", temp_root.display()))?;
    TempFileBuilder::new()
        .prefix(prefix)
        .tempdir_in(temp_root)
        .with_context(|| format!("Failed to create working directory in {}", temp_root.display()))
}

/// Bytes held by the regular files under `root` whose root-relative path
/// passes `include`. An excluded directory is not descended into.
pub fn directory_size<F: Fn(&Path) -> bool>(root: &Path, include: F) -> Result<u64> {
    if !root.is_dir() {
        return Ok(0);
    }
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        match entry.path().strip_prefix(root) {
            Ok(relative) => relative.as_os_str().is_empty() || include(relative),
            Err(_) => true,
        }
    });
    let mut total = 0u64;
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Deletes a file or a whole directory tree. A missing path is not an error.
pub fn remove_recursively(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
    }
}
