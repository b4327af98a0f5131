//! Table/field/index model shared by the live database introspection and the
//! structure document stored inside every backup.

pub mod diff;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::db::LiveDatabase;
use crate::errors::{Result, VaultError};

pub use diff::{diff, sequence_repair, AlterScript, SchemaChange};

/// Format version written into structure.json.
pub const STRUCTURE_FORMAT: u32 = 1;

/// Tables owned by this tool. They are never exported nor restored.
pub fn is_internal_table(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.starts_with("vault_") || name.starts_with("vault$")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FieldType {
    /// Signed integer of 2, 4 or 8 bytes.
    Int { bytes: u8 },
    Char { length: u32 },
    Text,
    Number { precision: u32, scale: u32 },
    Float { bytes: u8 },
    Binary,
    Boolean,
    Date,
    Timestamp,
    TimestampTz,
    Json,
    Other { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub notnull: bool,
    #[serde(default)]
    pub default: Option<String>,
    /// Value generated by an auto-increment sequence.
    #[serde(default)]
    pub sequence: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDescriptor {
    /// Two indexes are equivalent when they cover the same columns with the same uniqueness,
    /// whatever they are called.
    pub fn same_shape(&self, other: &IndexDescriptor) -> bool {
        self.unique == other.unique && self.columns == other.columns
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub indexes: Vec<IndexDescriptor>,
}

impl TableDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn sequence_field(&self) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.sequence)
    }

    /// Column rows are exported in: `id` when present, otherwise the first column.
    pub fn sort_field(&self) -> Option<&str> {
        self.field("id")
            .or_else(|| self.fields.first())
            .map(|f| f.name.as_str())
    }
}

/// A configuration value from the backup that is written into the
/// destination's `config` (no plugin) or `config_plugins` table after restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigOverride {
    pub name: String,
    #[serde(default)]
    pub plugin: Option<String>,
    pub value: String,
}

impl ConfigOverride {
    pub fn applies_to(&self, table: &str) -> bool {
        match (&self.plugin, table) {
            (None, "config") => true,
            (Some(p), "config_plugins") => !p.is_empty(),
            _ => false,
        }
    }
}

/// Table name -> highest sequence value seen at backup time.
pub type SequenceMap = BTreeMap<String, i64>;

#[derive(Debug, Serialize, Deserialize)]
struct StructureDocument {
    format: u32,
    tables: Vec<TableDescriptor>,
}

/// A set of tables, keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbStructure {
    pub tables: BTreeMap<String, TableDescriptor>,
}

impl DbStructure {
    /// Introspects the live schema.
    pub async fn load_actual(db: &dyn LiveDatabase) -> Result<Self> {
        Ok(DbStructure {
            tables: db.describe_tables().await?,
        })
    }

    /// Parses the structure document that was produced at backup time.
    pub fn load_from_backup(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_document(&content)
    }

    pub fn from_document(content: &str) -> Result<Self> {
        let doc: StructureDocument = serde_json::from_str(content)?;
        if doc.format > STRUCTURE_FORMAT {
            return Err(VaultError::Integrity(format!(
                "Structure document format {} is newer than supported format {}",
                doc.format, STRUCTURE_FORMAT
            )));
        }
        Ok(DbStructure {
            tables: doc.tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
        })
    }

    /// Serializes the named tables (in name order) into a structure document.
    pub fn to_document<S: AsRef<str>>(&self, names: &[S]) -> Result<String> {
        let mut tables: Vec<TableDescriptor> = names
            .iter()
            .filter_map(|n| self.tables.get(n.as_ref()).cloned())
            .collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(serde_json::to_string_pretty(&StructureDocument {
            format: STRUCTURE_FORMAT,
            tables,
        })?)
    }

    /// Tables that take part in backup and restore.
    pub fn backup_tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values().filter(|t| !is_internal_table(&t.name))
    }
}
