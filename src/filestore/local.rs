// sitevault/src/filestore/local.rs
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use super::{blob_subpath, ContentEntry, FileStore};
use crate::db::postgres::quote_ident;
use crate::errors::{Result, VaultError};

/// Blobs stored on disk under `filedir/hh/hh/hash`, with the logical file
/// records in the site database.
pub struct LocalFileStore {
    pool: PgPool,
    filedir: PathBuf,
    distinct_sql: String,
}

impl LocalFileStore {
    pub fn new(pool: PgPool, filedir: &Path, files_table: &str) -> Self {
        let distinct_sql = format!(
            "SELECT contenthash::text, MAX(filesize)::int8
             FROM {}
             WHERE contenthash IS NOT NULL AND contenthash <> ''
             GROUP BY contenthash
             ORDER BY contenthash",
            quote_ident(files_table)
        );
        LocalFileStore {
            pool,
            filedir: filedir.to_path_buf(),
            distinct_sql,
        }
    }
}

/// Hex SHA-256 of a file's content.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Places `source` into `filedir` as the blob for `contenthash`.
///
/// The content must hash to `contenthash`. The blob is written to a temporary
/// name and renamed, so a reader never sees a partial file. Returns `false`
/// when the blob was already present.
pub fn store_blob(filedir: &Path, source: &Path, contenthash: &str) -> Result<bool> {
    let subpath = blob_subpath(contenthash)
        .ok_or_else(|| VaultError::Integrity(format!("'{}' is not a content hash", contenthash)))?;
    let dest = filedir.join(&subpath);
    if dest.is_file() {
        return Ok(false);
    }

    let actual = sha256_file(source)?;
    if actual != contenthash {
        return Err(VaultError::Integrity(format!(
            "Content of {} hashes to {}",
            contenthash, actual
        )));
    }

    let parent = dest
        .parent()
        .ok_or_else(|| VaultError::FatalLocal(format!("No parent for {}", dest.display())))?;
    fs::create_dir_all(parent)?;
    let partial = parent.join(format!(".{}.{}", contenthash, uuid::Uuid::new_v4().simple()));
    fs::copy(source, &partial)?;
    if let Err(e) = fs::rename(&partial, &dest) {
        if let Err(clean_err) = fs::remove_file(&partial) {
            tracing::warn!("Could not delete {}: {}", partial.display(), clean_err);
        }
        return Err(e.into());
    }
    Ok(true)
}

#[async_trait]
impl FileStore for LocalFileStore {
    fn distinct_contents(&self) -> BoxStream<'_, Result<ContentEntry>> {
        sqlx::query_as::<_, (String, Option<i64>)>(&self.distinct_sql)
            .fetch(&self.pool)
            .map(|row| {
                let (contenthash, size) = row?;
                Ok(ContentEntry {
                    contenthash,
                    size: size.unwrap_or(0).max(0) as u64,
                })
            })
            .boxed()
    }

    async fn copy_content_to(&self, entry: &ContentEntry, dest: &Path) -> Result<()> {
        let subpath = blob_subpath(&entry.contenthash).ok_or_else(|| {
            VaultError::Integrity(format!("'{}' is not a content hash", entry.contenthash))
        })?;
        let source = self.filedir.join(subpath);
        if !tokio::fs::try_exists(&source).await? {
            return Err(VaultError::Integrity(format!(
                "Blob {} is missing from {}",
                entry.contenthash,
                self.filedir.display()
            )));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, dest).await?;
        Ok(())
    }

    async fn add_to_pool(&self, source: &Path, contenthash: &str) -> Result<()> {
        let filedir = self.filedir.clone();
        let source = source.to_path_buf();
        let contenthash = contenthash.to_string();
        let added = tokio::task::spawn_blocking(move || store_blob(&filedir, &source, &contenthash))
            .await
            .map_err(|e| VaultError::FatalLocal(format!("Blob registration task failed: {}", e)))??;
        if !added {
            tracing::debug!("Blob already present in {}", self.filedir.display());
        }
        Ok(())
    }
}
