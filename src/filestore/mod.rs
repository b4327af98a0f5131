//! Content-addressed file store: export and import of physical blobs,
//! deduplicated by content hash.

pub mod exporter;
pub mod importer;
pub(crate) mod local;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::Path;

use crate::errors::Result;

pub use exporter::export_filedir;
pub use importer::import_filedir;
pub use local::LocalFileStore;

/// One physical blob; many logical files may point at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    pub contenthash: String,
    pub size: u64,
}

/// `ab/cd/abcdef...`: two levels of two hex characters, then the full hash.
pub fn blob_subpath(contenthash: &str) -> Option<String> {
    if !is_content_hash(contenthash) {
        return None;
    }
    Some(format!(
        "{}/{}/{}",
        &contenthash[0..2],
        &contenthash[2..4],
        contenthash
    ))
}

pub fn is_content_hash(value: &str) -> bool {
    value.len() >= 4 && value.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// The site's live file store.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// One entry per distinct content hash, in hash order. Restart by calling again.
    fn distinct_contents(&self) -> BoxStream<'_, Result<ContentEntry>>;

    /// Copies the blob's bytes to `dest`. A blob missing from disk is an
    /// integrity error.
    async fn copy_content_to(&self, entry: &ContentEntry, dest: &Path) -> Result<()>;

    /// Registers the file at `source` as the blob for `contenthash`.
    /// Registering an already present blob is a no-op.
    async fn add_to_pool(&self, source: &Path, contenthash: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_subpath() {
        let hash = "3f786850e387550fdab836ed7e6dc881de23001b";
        assert_eq!(
            blob_subpath(hash).as_deref(),
            Some("3f/78/3f786850e387550fdab836ed7e6dc881de23001b")
        );
        assert_eq!(blob_subpath("abc"), None);
        assert_eq!(blob_subpath("../etc/passwd"), None);
        assert_eq!(blob_subpath("ABCDEF"), None);
    }
}
