// sitevault/src/filestore/importer.rs
use std::path::Path;

use super::{blob_subpath, FileStore};
use crate::errors::Result;
use crate::host::Host;
use crate::operation::OperationLog;
use crate::utils::archive::stream_entries;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub registered: usize,
    /// Entries whose path does not match their own hash.
    pub skipped: usize,
    /// Entries the store refused.
    pub failed: usize,
}

/// Registers every blob of a filedir archive into `store`.
///
/// Entries are read one at a time. An entry is accepted only when its path
/// inside the archive is exactly `hh/hh/<basename>` for its own basename;
/// anything else is skipped. Per-blob failures are logged and the import
/// moves on. Only an unreadable archive is an error.
pub async fn import_filedir(
    store: &dyn FileStore,
    host: &dyn Host,
    archive_path: &Path,
    scratch_dir: &Path,
    log: &OperationLog,
) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    let mut entries = stream_entries(archive_path, scratch_dir);

    while let Some(entry) = entries.recv().await {
        let entry = entry?;
        let basename = entry.subpath.rsplit('/').next().unwrap_or_default().to_string();

        if blob_subpath(&basename).as_deref() != Some(entry.subpath.as_str()) {
            log.warn(format!("Skipping unexpected file '{}' in filedir archive", entry.subpath))
                .await;
            summary.skipped += 1;
        } else {
            match store.add_to_pool(&entry.path, &basename).await {
                Ok(()) => summary.registered += 1,
                Err(e) => {
                    log.warn(format!("Could not restore file {}: {}", basename, e)).await;
                    summary.failed += 1;
                }
            }
        }

        if let Err(e) = tokio::fs::remove_file(&entry.path).await {
            tracing::debug!("Could not remove {}: {}", entry.path.display(), e);
        }
        host.extend_timeout();
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filestore::export_filedir;
    use crate::operation::OperationKind;
    use crate::test_support::Fixture;
    use crate::utils::archive::create_tar_gz_archive;
    use std::fs;

    #[tokio::test]
    async fn test_import_skips_misplaced_and_rejected_entries() -> anyhow::Result<()> {
        let source = Fixture::new();
        let good = source.files.add_file("a.txt", b"alpha");
        let rejected = source.files.add_file("b.txt", b"beta");
        let op = source.scheduled(OperationKind::Backup).await?;
        let log = source.site.log_for(&op);

        // Export, then add an entry placed under the wrong prefix.
        let work = source.dir.path().join("work");
        let archive_path = work.join("filedir.tar.gz");
        export_filedir(
            source.files.as_ref(),
            source.host.as_ref(),
            &work.join("staging"),
            &archive_path,
            &log,
        )
        .await?;
        let tree = work.join("tree");
        crate::utils::archive::extract_tar_gz_archive(&archive_path, &tree)?;
        let misplaced = format!("00/00/{}", good);
        fs::create_dir_all(tree.join("00/00"))?;
        fs::write(tree.join(&misplaced), b"alpha")?;
        fs::write(tree.join("README"), b"stray")?;
        create_tar_gz_archive(&tree, &archive_path, |_| true)?;

        let dest = Fixture::new();
        dest.files.reject(&rejected);
        let dest_op = dest.scheduled(OperationKind::Restore).await?;
        let dest_log = dest.site.log_for(&dest_op);
        let summary = import_filedir(
            dest.files.as_ref(),
            dest.host.as_ref(),
            &archive_path,
            &dest.dir.path().join("scratch"),
            &dest_log,
        )
        .await?;

        assert_eq!(summary.registered, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(dest.files.blob(&good).as_deref(), Some(&b"alpha"[..]));
        assert_eq!(dest.files.registrations(), 1);
        assert_eq!(dest.registry.messages(dest_op.id, crate::operation::LogLevel::Warning).len(), 3);
        // Scratch copies are consumed.
        assert_eq!(fs::read_dir(dest.dir.path().join("scratch"))?.count(), 0);
        Ok(())
    }
}
