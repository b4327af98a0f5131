// sitevault/src/restore/dataroot.rs
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::errors::Result;
use crate::utils::archive::unpack_archive;
use crate::utils::remove_recursively;

/// Dataroot subdirectory the backup's dataroot is unpacked into before the swap.
pub const RESTORE_STAGING: &str = "__vault_restore__";

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SwapReport {
    pub replaced: Vec<String>,
    /// Entries left untouched, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Unpacks the dataroot archive into `<dataroot>/__vault_restore__`, removing
/// anything left there by an earlier attempt.
pub async fn stage_dataroot(archive: &Path, dataroot: &Path) -> Result<PathBuf> {
    let staging = dataroot.join(RESTORE_STAGING);
    remove_recursively(&staging)?;
    unpack_archive(archive, &staging).await?;
    Ok(staging)
}

/// Replaces every top-level dataroot entry that exists in `staging`.
///
/// Each destination entry is removed with `remove` and the staged entry moved
/// into its place. An entry whose removal fails is left as it is and reported;
/// the other entries are still swapped. The staging directory is removed at
/// the end.
pub fn swap_dataroot<F>(staging: &Path, dataroot: &Path, remove: F) -> io::Result<SwapReport>
where
    F: Fn(&Path) -> io::Result<()>,
{
    let mut names: Vec<String> = fs::read_dir(staging)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    let mut report = SwapReport::default();
    for name in names {
        let dest = dataroot.join(&name);
        if let Err(e) = remove(&dest) {
            report.failed.push((name, format!("could not delete {}: {}", dest.display(), e)));
            continue;
        }
        match fs::rename(staging.join(&name), &dest) {
            Ok(()) => report.replaced.push(name),
            Err(e) => report.failed.push((name, format!("could not move into place: {}", e))),
        }
    }
    remove_recursively(staging)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) -> io::Result<()> {
        fs::create_dir_all(path.parent().expect("parent"))?;
        fs::write(path, content)
    }

    #[test]
    fn test_undeletable_entry_is_left_alone() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let dataroot = dir.path();
        write(&dataroot.join("lang/en.txt"), "old lang")?;
        write(&dataroot.join("locked/data.txt"), "old locked")?;
        write(&dataroot.join("filedir/ab/cd/abcd"), "blob")?;
        let staging = dataroot.join(RESTORE_STAGING);
        write(&staging.join("lang/en.txt"), "new lang")?;
        write(&staging.join("locked/data.txt"), "new locked")?;
        write(&staging.join("models/m.bin"), "new model")?;

        let report = swap_dataroot(&staging, dataroot, |path| {
            if path.ends_with("locked") {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
            } else {
                remove_recursively(path)
            }
        })?;

        assert_eq!(report.replaced, vec!["lang".to_string(), "models".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "locked");
        assert_eq!(fs::read_to_string(dataroot.join("lang/en.txt"))?, "new lang");
        assert_eq!(fs::read_to_string(dataroot.join("locked/data.txt"))?, "old locked");
        assert_eq!(fs::read_to_string(dataroot.join("models/m.bin"))?, "new model");
        // entries absent from the backup are kept
        assert!(dataroot.join("filedir/ab/cd/abcd").is_file());
        assert!(!staging.exists());
        Ok(())
    }
}
