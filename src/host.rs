// sitevault/src/host.rs
use async_trait::async_trait;
use sqlx::PgPool;
use std::path::{Path, PathBuf};

use crate::db::postgres::quote_ident;
use crate::errors::{Result, VaultError};
use crate::utils::remove_recursively;

/// Dataroot subdirectories emptied by a cache purge.
pub const CACHE_DIRS: [&str; 2] = ["cache", "localcache"];

/// Hooks into the running site that are not part of its data.
#[async_trait]
pub trait Host: Send + Sync {
    /// Logs every user out.
    async fn kill_all_sessions(&self) -> Result<()>;

    async fn purge_caches(&self) -> Result<()>;

    /// Called by long-running steps so the host does not kill the worker.
    fn extend_timeout(&self);

    /// Bytes available to unprivileged users on the filesystem holding `path`.
    fn free_disk_space(&self, path: &Path) -> Result<u64>;
}

pub struct SiteHost {
    pool: PgPool,
    dataroot: PathBuf,
    session_table: String,
}

impl SiteHost {
    pub fn new(pool: PgPool, dataroot: &Path, session_table: &str) -> Self {
        SiteHost {
            pool,
            dataroot: dataroot.to_path_buf(),
            session_table: session_table.to_string(),
        }
    }
}

#[async_trait]
impl Host for SiteHost {
    async fn kill_all_sessions(&self) -> Result<()> {
        let deleted = sqlx::query(&format!("DELETE FROM {}", quote_ident(&self.session_table)))
            .execute(&self.pool)
            .await?
            .rows_affected();
        tracing::info!("Terminated {} session(s)", deleted);
        Ok(())
    }

    async fn purge_caches(&self) -> Result<()> {
        for name in CACHE_DIRS {
            let dir = self.dataroot.join(name);
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if let Err(e) = remove_recursively(&path) {
                    tracing::warn!("Could not purge {}: {}", path.display(), e);
                }
            }
        }
        Ok(())
    }

    fn extend_timeout(&self) {
        tracing::trace!("Execution time extended");
    }

    fn free_disk_space(&self, path: &Path) -> Result<u64> {
        free_disk_space(path)
    }
}

#[cfg(unix)]
pub fn free_disk_space(path: &Path) -> Result<u64> {
    use libc::statvfs;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let path_c = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| VaultError::FatalLocal(format!("Invalid path {}: {}", path.display(), e)))?;
    let mut stat: statvfs = unsafe { std::mem::zeroed() };
    let result = unsafe { statvfs(path_c.as_ptr(), &mut stat) };
    if result != 0 {
        return Err(VaultError::FatalLocal(format!(
            "Cannot read free space of {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }
    Ok((stat.f_bavail as u64) * (stat.f_frsize as u64))
}

#[cfg(not(unix))]
pub fn free_disk_space(path: &Path) -> Result<u64> {
    Err(VaultError::FatalLocal(format!(
        "Free space of {} cannot be determined on this platform",
        path.display()
    )))
}
