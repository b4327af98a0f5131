// sitevault/src/backup/db_export.rs
use futures::TryStreamExt;
use std::fs;
use std::path::Path;

use super::documents::{
    TableDocumentWriter, CONFIG_OVERRIDE_FILE, METADATA_FILE, SEQUENCES_FILE, STRUCTURE_FILE,
};
use crate::errors::Result;
use crate::operation::{Metadata, OperationLog};
use crate::schema::{DbStructure, SequenceMap};
use crate::site::Site;

/// What the structure phase recorded; the data phase works from the same snapshot.
#[derive(Debug, Clone)]
pub struct StructureExport {
    pub structure: DbStructure,
    pub tables: Vec<String>,
    pub sequences: SequenceMap,
}

/// Writes structure.json, sequences.json, configoverride.json and
/// metadata.json into `dir`.
pub async fn export_structure(site: &Site, dir: &Path, origin: &Metadata) -> Result<StructureExport> {
    fs::create_dir_all(dir)?;
    let structure = DbStructure::load_actual(site.db.as_ref()).await?;
    let tables: Vec<String> = structure.backup_tables().map(|t| t.name.clone()).collect();

    let mut sequences = SequenceMap::new();
    for table in structure.backup_tables() {
        if table.sequence_field().is_none() {
            continue;
        }
        if let Some(max) = site.db.max_id(table).await? {
            sequences.insert(table.name.clone(), max);
        }
    }

    let export = StructureExport {
        structure,
        tables,
        sequences,
    };
    write_structure_documents(&export, dir)?;
    fs::write(
        dir.join(CONFIG_OVERRIDE_FILE),
        serde_json::to_string_pretty(&site.settings.config_overrides)?,
    )?;
    fs::write(dir.join(METADATA_FILE), serde_json::to_string_pretty(origin)?)?;
    Ok(export)
}

fn write_structure_documents(export: &StructureExport, dir: &Path) -> Result<()> {
    fs::write(dir.join(STRUCTURE_FILE), export.structure.to_document(&export.tables)?)?;
    fs::write(
        dir.join(SEQUENCES_FILE),
        serde_json::to_string_pretty(&export.sequences)?,
    )?;
    Ok(())
}

/// Writes one or more documents per table into `dir`, plus the structure and
/// sequence documents. Returns the number of rows exported.
pub async fn export_tables(
    site: &Site,
    export: &StructureExport,
    dir: &Path,
    log: &OperationLog,
) -> Result<u64> {
    fs::create_dir_all(dir)?;
    let mut total = 0u64;

    for name in &export.tables {
        let Some(table) = export.structure.tables.get(name) else {
            continue;
        };
        let mut writer = TableDocumentWriter::new(
            dir,
            &table.name,
            &table.field_names(),
            site.settings.rows_per_document,
        )?;
        let mut rows = site.db.stream_rows(table);
        while let Some(row) = rows.try_next().await? {
            writer.write_row(&row)?;
        }
        let (documents, count) = writer.finish()?;
        site.host.extend_timeout();
        tracing::debug!("Table {} written to {} document(s)", table.name, documents.len());
        log.info(format!("Exported table {}: {} row(s)", table.name, count)).await;
        total += count;
    }

    write_structure_documents(export, dir)?;
    Ok(total)
}
