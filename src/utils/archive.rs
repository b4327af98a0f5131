// sitevault/src/utils/archive.rs
use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use tar::Builder;
use tokio::sync::mpsc;
use walkdir::WalkDir;

/// Creates a GZipped TAR archive from a source directory.
///
/// Paths inside the archive are relative to `source_dir` and use `/` as
/// separator. `include` receives each relative path; returning `false` for a
/// directory prunes everything below it.
///
/// # Returns
/// Size in bytes of the created archive.
pub fn create_tar_gz_archive<F>(
    source_dir: &Path,
    archive_dest_path: &Path,
    include: F,
) -> Result<u64>
where
    F: Fn(&Path) -> bool,
{
    if !source_dir.is_dir() {
        return Err(anyhow::anyhow!(
            "Source for archival is not a directory: {}",
            source_dir.display()
        ));
    }
    if let Some(parent) = archive_dest_path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "Failed to create parent directory for archive: {}",
                    parent.display()
                )
            })?;
        }
    }

    tracing::debug!(
        "Creating tar.gz archive from {} to {}",
        source_dir.display(),
        archive_dest_path.display()
    );

    let archive_file = File::create(archive_dest_path).with_context(|| {
        format!(
            "Failed to create archive file: {}",
            archive_dest_path.display()
        )
    })?;
    let enc = GzEncoder::new(archive_file, Compression::default());
    let mut tar_builder = Builder::new(enc);

    let walker = WalkDir::new(source_dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(source_dir)
                .map(|name| include(name))
                .unwrap_or(false)
        });

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk directory: {}", source_dir.display()))?;
        let path = entry.path();
        let name = path.strip_prefix(source_dir).with_context(|| {
            format!(
                "Failed to strip prefix {} from {}",
                source_dir.display(),
                path.display()
            )
        })?;

        if entry.file_type().is_dir() {
            tar_builder.append_dir(name, path).with_context(|| {
                format!("Failed to append directory {} to archive", path.display())
            })?;
        } else if entry.file_type().is_file() {
            tar_builder.append_path_with_name(path, name).with_context(|| {
                format!("Failed to append file {} as {} to archive", path.display(), name.display())
            })?;
        } else {
            tracing::debug!("Skipping special file {}", path.display());
        }
    }

    let encoder = tar_builder.into_inner().with_context(|| {
        format!(
            "Failed to get inner encoder from tar builder for archive: {}",
            archive_dest_path.display()
        )
    })?;

    encoder.finish().with_context(|| {
        format!(
            "Failed to finish Gzip encoding for archive: {}",
            archive_dest_path.display()
        )
    })?;

    let size = fs::metadata(archive_dest_path)?.len();
    tracing::debug!(
        "✓ Tar.gz archive created at {} ({} bytes)",
        archive_dest_path.display(),
        size
    );
    Ok(size)
}

/// Runs [`create_tar_gz_archive`] on a blocking thread.
pub async fn pack_directory(
    source_dir: &Path,
    archive_dest_path: &Path,
    include: fn(&Path) -> bool,
) -> Result<u64> {
    let source = source_dir.to_path_buf();
    let dest = archive_dest_path.to_path_buf();
    tokio::task::spawn_blocking(move || create_tar_gz_archive(&source, &dest, include))
        .await
        .context("Archive task panicked")?
}

/// Runs [`extract_tar_gz_archive`] on a blocking thread.
pub async fn unpack_archive(archive_path: &Path, extract_to_dir: &Path) -> Result<PathBuf> {
    let archive = archive_path.to_path_buf();
    let dest = extract_to_dir.to_path_buf();
    tokio::task::spawn_blocking(move || extract_tar_gz_archive(&archive, &dest))
        .await
        .context("Extraction task panicked")?
}

/// Extracts a GZipped TAR archive to a destination directory.
pub fn extract_tar_gz_archive(archive_path: &Path, extract_to_dir: &Path) -> Result<PathBuf> {
    if !archive_path.is_file() {
        return Err(anyhow::anyhow!(
            "Archive for extraction is not a file: {}",
            archive_path.display()
        ));
    }

    if !extract_to_dir.exists() {
        fs::create_dir_all(extract_to_dir).with_context(|| {
            format!(
                "Failed to create extraction directory: {}",
                extract_to_dir.display()
            )
        })?;
    } else if !extract_to_dir.is_dir() {
        return Err(anyhow::anyhow!(
            "Extraction path exists but is not a directory: {}",
            extract_to_dir.display()
        ));
    }

    let archive_file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive file: {}", archive_path.display()))?;
    let gz_decoder = flate2::read::GzDecoder::new(archive_file);
    let mut archive = tar::Archive::new(gz_decoder);

    archive.unpack(extract_to_dir).with_context(|| {
        format!(
            "Failed to unpack archive {} to {}",
            archive_path.display(),
            extract_to_dir.display()
        )
    })?;

    tracing::debug!(
        "✓ Tar.gz archive {} extracted to {}",
        archive_path.display(),
        extract_to_dir.display()
    );
    Ok(extract_to_dir.to_path_buf())
}

/// One regular file read out of an archive and parked in a scratch file.
#[derive(Debug)]
pub struct StagedEntry {
    /// Path inside the archive, `/`-separated.
    pub subpath: String,
    /// Scratch copy of the content; the consumer removes it.
    pub path: PathBuf,
    pub size: u64,
}

/// Reads the archive entry by entry on a blocking thread.
///
/// The returned channel yields regular files in archive order. At most a couple
/// of entries are staged on disk at any time; the sequence is forward-only and
/// can only be restarted by calling this again.
pub fn stream_entries(archive_path: &Path, scratch_dir: &Path) -> mpsc::Receiver<Result<StagedEntry>> {
    let (tx, rx) = mpsc::channel(2);
    let archive_path = archive_path.to_path_buf();
    let scratch_dir = scratch_dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = read_entries(&archive_path, &scratch_dir, &tx) {
            let _ = tx.blocking_send(Err(e));
        }
    });
    rx
}

fn read_entries(
    archive_path: &Path,
    scratch_dir: &Path,
    tx: &mpsc::Sender<Result<StagedEntry>>,
) -> Result<()> {
    fs::create_dir_all(scratch_dir)
        .with_context(|| format!("Failed to create scratch directory: {}", scratch_dir.display()))?;
    let archive_file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive file: {}", archive_path.display()))?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(archive_file));

    for (n, entry) in archive.entries()?.enumerate() {
        let mut entry = entry.with_context(|| format!("Corrupt entry in {}", archive_path.display()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let subpath = normalize_entry_path(&entry.path()?);
        let path = scratch_dir.join(format!("entry-{}", n));
        let mut out = File::create(&path)
            .with_context(|| format!("Failed to create scratch file: {}", path.display()))?;
        let size = std::io::copy(&mut entry, &mut out)?;
        drop(out);

        if tx.blocking_send(Ok(StagedEntry { subpath, path: path.clone(), size })).is_err() {
            // Consumer went away.
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("Could not delete {}: {}", path.display(), e);
            }
            break;
        }
    }
    Ok(())
}

fn normalize_entry_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
