//! Remote backup storage: where archive sets are shipped to and fetched from.

pub(crate) mod s3;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tokio::io::AsyncWriteExt;

use crate::errors::{transport, Result};
use crate::operation::Metadata;

pub use s3::S3RemoteStore;

/// One archive of a backup set, uploaded in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    DbStructure,
    DbDump,
    Dataroot,
    Filedir,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::DbStructure, Phase::DbDump, Phase::Dataroot, Phase::Filedir];

    pub fn file_name(self) -> &'static str {
        match self {
            Phase::DbStructure => "dbstructure.tar.gz",
            Phase::DbDump => "dbdump.tar.gz",
            Phase::Dataroot => "dataroot.tar.gz",
            Phase::Filedir => "filedir.tar.gz",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    InProgress,
    Finished,
    Failed,
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RemoteStatus::InProgress => "in_progress",
            RemoteStatus::Finished => "finished",
            RemoteStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteBackupDescriptor {
    pub backupkey: String,
    pub status: RemoteStatus,
    pub timecreated: DateTime<Utc>,
    pub timefinished: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Sum of all uploaded phases, known once the backup is finished.
    #[serde(default)]
    pub size_bytes: u64,
}

/// Upload/download contract of the remote backup service.
///
/// Any transport error or non-2xx answer is returned as a transport failure of
/// the calling phase.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Verifies that the configured credentials are accepted.
    async fn check_credentials(&self) -> Result<()>;

    /// Registers a new backup and returns its key. Quota or policy rejections
    /// come back as `PolicyViolation`.
    async fn announce(&self, metadata: &Metadata) -> Result<String>;

    /// Uploads one phase archive, chunked when large. Returns the uploaded size.
    async fn upload(&self, backupkey: &str, phase: Phase, source: &Path) -> Result<u64>;

    async fn download_url(&self, backupkey: &str, phase: Phase) -> Result<String>;

    /// Fetches one phase archive into `dest`. Returns the downloaded size.
    async fn download(&self, backupkey: &str, phase: Phase, dest: &Path) -> Result<u64> {
        let url = self.download_url(backupkey, phase).await?;
        download_to_file(&url, dest).await
    }

    async fn get_descriptor(&self, backupkey: &str) -> Result<RemoteBackupDescriptor>;

    /// Every known backup, newest first.
    async fn list(&self) -> Result<Vec<RemoteBackupDescriptor>>;

    async fn patch_status(&self, backupkey: &str, status: RemoteStatus) -> Result<()>;
}

/// Streams `url` into `dest` without buffering the whole body.
pub async fn download_to_file(url: &str, dest: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let response = reqwest::get(url)
        .await
        .map_err(|e| transport("Download request failed", e))?;
    if !response.status().is_success() {
        return Err(transport(
            &format!("Download of {} refused", dest.display()),
            response.status(),
        ));
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut total = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| transport("Download interrupted", e))?;
        file.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(total)
}
