pub(crate) mod postgres;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::errors::Result;
use crate::schema::{ConfigOverride, SchemaChange, TableDescriptor};

pub use postgres::PgDatabase;

/// Engine name recorded in origin metadata.
pub const DB_ENGINE: &str = "postgres";

/// Rows fetched per round trip when streaming a table.
pub const ROW_BATCH_SIZE: i64 = 500;

/// The site's live relational database, seen through the operations the
/// backup and restore pipelines need.
#[async_trait]
pub trait LiveDatabase: Send + Sync {
    /// Every base table in the application schema, internal tables included.
    async fn describe_tables(&self) -> Result<BTreeMap<String, TableDescriptor>>;

    /// Rows of `table` as positional values in field order, sorted by
    /// [`TableDescriptor::sort_field`]. Restart by calling again.
    fn stream_rows<'a>(&'a self, table: &'a TableDescriptor) -> BoxStream<'a, Result<Vec<Value>>>;

    /// Inserts one row with explicit values for `fields`, bypassing any
    /// application-level validation.
    async fn insert_raw(&self, table: &str, fields: &[String], row: &[Value]) -> Result<()>;

    async fn truncate(&self, table: &str) -> Result<()>;

    async fn apply_change(&self, change: &SchemaChange) -> Result<()>;

    /// Highest value of the table's sequence column, `None` if it has none.
    async fn max_id(&self, table: &TableDescriptor) -> Result<Option<i64>>;

    async fn set_config(&self, entry: &ConfigOverride) -> Result<()>;

    /// Approximate on-disk size of the database, used to estimate a backup.
    async fn size_bytes(&self) -> Result<u64>;
}
