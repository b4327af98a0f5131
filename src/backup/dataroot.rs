// sitevault/src/backup/dataroot.rs
use std::path::{Component, Path};

use crate::errors::Result;
use crate::utils::archive::pack_directory;

/// Top-level dataroot entries that are never backed up. `filedir` travels in
/// its own archive; the rest is transient.
pub const EXCLUDED_ENTRIES: [&str; 10] = [
    "filedir",
    "cache",
    "localcache",
    "temp",
    "sessions",
    "trashdir",
    "phpunit",
    "phpunittestdir.txt",
    "originaldatafiles.json",
    "__vault_restore__",
];

/// Whether a dataroot-relative path is left out of the dataroot archive.
///
/// Only the first path component is matched, so a nested `cache` directory is
/// kept.
pub fn is_excluded(relative: &Path) -> bool {
    let mut components = relative.components();
    let Some(Component::Normal(first)) = components.next() else {
        return false;
    };
    let first = first.to_string_lossy();
    first.starts_with('.') || EXCLUDED_ENTRIES.contains(&first.as_ref())
}

/// Archives the dataroot without its excluded entries. Returns the archive size.
pub async fn export_dataroot(dataroot: &Path, archive_path: &Path) -> Result<u64> {
    Ok(pack_directory(dataroot, archive_path, |relative| !is_excluded(relative)).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::archive::extract_tar_gz_archive;
    use std::fs;

    #[test]
    fn test_only_top_level_entries_are_excluded() {
        assert!(is_excluded(Path::new("cache")));
        assert!(is_excluded(Path::new("cache/stale.bin")));
        assert!(is_excluded(Path::new(".git")));
        assert!(is_excluded(Path::new("__vault_restore__/lang")));
        assert!(is_excluded(Path::new("phpunit/config.php")));
        assert!(is_excluded(Path::new("phpunittestdir.txt")));
        assert!(is_excluded(Path::new("originaldatafiles.json")));
        assert!(!is_excluded(Path::new("lang/cache")));
        assert!(!is_excluded(Path::new("lang/.hidden")));
        assert!(!is_excluded(Path::new("cachedir")));
    }

    #[tokio::test]
    async fn test_dataroot_archive_keeps_nested_cache() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dataroot = dir.path().join("dataroot");
        for path in [
            "cache/top.bin",
            "lang/cache/nested.txt",
            "lang/en/strings.txt",
            "filedir/ab/cd/abcd",
            "temp/vault/work.tmp",
            ".htaccess",
        ] {
            let full = dataroot.join(path);
            fs::create_dir_all(full.parent().expect("parent"))?;
            fs::write(full, path)?;
        }

        let archive = dir.path().join("dataroot.tar.gz");
        export_dataroot(&dataroot, &archive).await?;
        let out = dir.path().join("out");
        extract_tar_gz_archive(&archive, &out)?;

        assert!(out.join("lang/cache/nested.txt").is_file());
        assert!(out.join("lang/en/strings.txt").is_file());
        assert!(!out.join("cache").exists());
        assert!(!out.join("filedir").exists());
        assert!(!out.join("temp").exists());
        assert!(!out.join(".htaccess").exists());
        Ok(())
    }
}
