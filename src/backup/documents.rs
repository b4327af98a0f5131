// sitevault/src/backup/documents.rs
//! File names and JSON layout of the documents inside the database archives.
//!
//! A table document is a JSON array whose first element is the array of field
//! names, followed by one positional array per row:
//!
//! ```text
//! [["id","name"],
//! [1,"first"],
//! [2,"second"]
//! ]
//! ```

use serde_json::Value;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::ErrorKind;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::errors::{Result, VaultError};

pub const STRUCTURE_FILE: &str = "structure.json";
pub const SEQUENCES_FILE: &str = "sequences.json";
pub const CONFIG_OVERRIDE_FILE: &str = "configoverride.json";
pub const METADATA_FILE: &str = "metadata.json";

/// Separates a table name from the index of its continuation documents.
pub const PART_SEPARATOR: char = '@';

/// `<table>.json` for the first document of a table, `<table>@<n>.json` after.
pub fn document_name(table: &str, index: usize) -> String {
    if index == 0 {
        format!("{}.json", table)
    } else {
        format!("{}{}{}.json", table, PART_SEPARATOR, index)
    }
}

/// Reverses [`document_name`] against the set of tables in the backup.
pub fn parse_document_name(file_name: &str, tables: &BTreeSet<String>) -> Option<(String, usize)> {
    let stem = file_name.strip_suffix(".json")?;
    if tables.contains(stem) {
        return Some((stem.to_string(), 0));
    }
    let (table, index) = stem.rsplit_once(PART_SEPARATOR)?;
    let index: usize = index.parse().ok()?;
    if index > 0 && tables.contains(table) {
        Some((table.to_string(), index))
    } else {
        None
    }
}

/// Writes the rows of one table, starting a new document every
/// `rows_per_document` rows. An empty table still gets one header-only document.
pub struct TableDocumentWriter {
    dir: PathBuf,
    table: String,
    header: String,
    rows_per_document: usize,
    current: Option<BufWriter<File>>,
    rows_in_current: usize,
    documents: Vec<String>,
    rows: u64,
}

impl TableDocumentWriter {
    pub fn new(dir: &Path, table: &str, fields: &[String], rows_per_document: usize) -> Result<Self> {
        Ok(TableDocumentWriter {
            dir: dir.to_path_buf(),
            table: table.to_string(),
            header: serde_json::to_string(fields)?,
            rows_per_document: rows_per_document.max(1),
            current: None,
            rows_in_current: 0,
            documents: Vec::new(),
            rows: 0,
        })
    }

    fn open_next(&mut self) -> Result<()> {
        self.close_current()?;
        let name = document_name(&self.table, self.documents.len());
        // Another table already wrote a document under this name.
        let file = File::create_new(self.dir.join(&name)).map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => VaultError::Integrity(format!(
                "Document {} of table {} clashes with another table",
                name, self.table
            )),
            _ => e.into(),
        })?;
        let mut writer = BufWriter::new(file);
        write!(writer, "[{}", self.header)?;
        self.current = Some(writer);
        self.rows_in_current = 0;
        self.documents.push(name);
        Ok(())
    }

    fn close_current(&mut self) -> Result<()> {
        if let Some(mut writer) = self.current.take() {
            writeln!(writer, "\n]")?;
            writer.flush()?;
        }
        Ok(())
    }

    pub fn write_row(&mut self, row: &[Value]) -> Result<()> {
        if self.current.is_none() || self.rows_in_current >= self.rows_per_document {
            self.open_next()?;
        }
        let writer = self
            .current
            .as_mut()
            .ok_or_else(|| VaultError::InvalidState("table document is not open".into()))?;
        writeln!(writer, ",")?;
        serde_json::to_writer(&mut *writer, row)?;
        self.rows_in_current += 1;
        self.rows += 1;
        Ok(())
    }

    /// Closes the last document. Returns the document names and the row count.
    pub fn finish(mut self) -> Result<(Vec<String>, u64)> {
        if self.documents.is_empty() {
            self.open_next()?;
        }
        self.close_current()?;
        Ok((std::mem::take(&mut self.documents), self.rows))
    }
}

/// Parses a table document into its header and rows.
pub fn read_table_document(path: &Path) -> Result<(Vec<String>, Vec<Value>)> {
    let content = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&content)?;
    let Value::Array(mut items) = value else {
        return Err(VaultError::Integrity(format!("{} is not a JSON array", path.display())));
    };
    if items.is_empty() {
        return Err(VaultError::Integrity(format!("{} has no header", path.display())));
    }
    let header: Vec<String> = serde_json::from_value(items.remove(0)).map_err(|e| {
        VaultError::Integrity(format!("{} has an invalid header: {}", path.display(), e))
    })?;
    Ok((header, items))
}
