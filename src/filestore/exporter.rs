// sitevault/src/filestore/exporter.rs
use futures::TryStreamExt;
use std::path::Path;

use super::{blob_subpath, FileStore};
use crate::errors::{ErrorClass, Result};
use crate::host::Host;
use crate::operation::OperationLog;
use crate::utils::{archive, remove_recursively};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportSummary {
    /// Distinct blobs written to the archive.
    pub blobs: usize,
    /// Blobs the store could not provide.
    pub missing: usize,
    pub archive_size: u64,
}

/// Packs one copy of every distinct blob into `archive_path`.
///
/// Blobs are staged under `staging_dir` at `hh/hh/hash`, archived, and the
/// staging tree is removed afterwards. A blob missing from the store is
/// logged and left out; any other failure aborts the export.
pub async fn export_filedir(
    store: &dyn FileStore,
    host: &dyn Host,
    staging_dir: &Path,
    archive_path: &Path,
    log: &OperationLog,
) -> Result<ExportSummary> {
    tokio::fs::create_dir_all(staging_dir).await?;
    let mut summary = ExportSummary::default();

    let mut contents = store.distinct_contents();
    while let Some(entry) = contents.try_next().await? {
        let Some(subpath) = blob_subpath(&entry.contenthash) else {
            log.warn(format!("Skipping file with invalid content hash '{}'", entry.contenthash))
                .await;
            continue;
        };
        let dest = staging_dir.join(&subpath);
        if tokio::fs::try_exists(&dest).await? {
            continue;
        }
        match store.copy_content_to(&entry, &dest).await {
            Ok(()) => summary.blobs += 1,
            Err(e) if e.class() == ErrorClass::IntegrityWarning => {
                log.warn(format!("{}", e)).await;
                summary.missing += 1;
            }
            Err(e) => return Err(e),
        }
        if summary.blobs % 1000 == 0 {
            host.extend_timeout();
        }
    }
    drop(contents);

    summary.archive_size = archive::pack_directory(staging_dir, archive_path, |_| true).await?;

    remove_recursively(staging_dir)?;
    Ok(summary)
}
