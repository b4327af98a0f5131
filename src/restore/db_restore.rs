// sitevault/src/restore/db_restore.rs
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use super::structure::BackupStructure;
use crate::backup::documents::{
    parse_document_name, read_table_document, CONFIG_OVERRIDE_FILE, METADATA_FILE, SEQUENCES_FILE,
    STRUCTURE_FILE,
};
use crate::errors::{Result, VaultError};
use crate::operation::OperationLog;
use crate::schema::{diff, sequence_repair, TableDescriptor};
use crate::site::Site;

/// Tables whose restore ends by applying the backup's configuration overrides.
const CONFIG_TABLES: &[&str] = &["config", "config_plugins"];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DbRestoreSummary {
    pub tables: usize,
    pub rows: u64,
    pub skipped_rows: u64,
    /// Tables left untouched because they could not be emptied.
    pub skipped_tables: Vec<String>,
}

/// Table documents in `dir` grouped per table and sorted by index, plus the
/// names of JSON files that belong to no table in the backup structure.
fn group_documents(dir: &Path, tables: &BTreeSet<String>) -> Result<(BTreeMap<String, Vec<PathBuf>>, Vec<String>)> {
    let mut grouped: BTreeMap<String, Vec<(usize, PathBuf)>> = BTreeMap::new();
    let mut unknown = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(".json") {
            continue;
        }
        match parse_document_name(&name, tables) {
            Some((table, index)) => grouped.entry(table).or_default().push((index, entry.path())),
            None => unknown.push(name),
        }
    }
    unknown.sort();
    let grouped = grouped
        .into_iter()
        .map(|(table, mut docs)| {
            docs.sort_by_key(|(index, _)| *index);
            (table, docs.into_iter().map(|(_, path)| path).collect())
        })
        .collect();
    Ok((grouped, unknown))
}

/// Restores every table of the backup from the documents in `dump_dir`.
///
/// Per table: align the live schema, empty the table, insert each row, then
/// move the sequence past the restored ids. Failures are logged and the
/// restore moves on; documents are deleted once read.
pub async fn restore_database(
    site: &Site,
    dump_dir: &Path,
    backup: &BackupStructure,
    log: &OperationLog,
) -> Result<DbRestoreSummary> {
    let actual = site.db.describe_tables().await?;
    let names: BTreeSet<String> = backup.structure.backup_tables().map(|t| t.name.clone()).collect();
    let (mut documents, unknown) = group_documents(dump_dir, &names)?;
    for name in unknown.iter().filter(|n| !is_structure_document(n)) {
        log.warn(format!("Document {} does not match any table in the backup, ignored", name))
            .await;
    }

    let mut summary = DbRestoreSummary::default();
    for table in backup.structure.backup_tables() {
        let docs = documents.remove(&table.name).unwrap_or_default();
        restore_table(site, table, actual.get(&table.name), &docs, backup, log, &mut summary).await;
        summary.tables += 1;
    }
    Ok(summary)
}

fn is_structure_document(name: &str) -> bool {
    [STRUCTURE_FILE, SEQUENCES_FILE, CONFIG_OVERRIDE_FILE, METADATA_FILE].contains(&name)
}

async fn restore_table(
    site: &Site,
    table: &TableDescriptor,
    actual: Option<&TableDescriptor>,
    docs: &[PathBuf],
    backup: &BackupStructure,
    log: &OperationLog,
    summary: &mut DbRestoreSummary,
) {
    site.host.extend_timeout();
    let name = &table.name;

    if let Some(script) = diff(table, actual, &site.settings.preserve_columns) {
        for change in script {
            if let Err(e) = site.db.apply_change(&change).await {
                log.warn(format!("Could not alter table {} ({:?}): {}", name, change, e))
                    .await;
            }
        }
    }

    if let Err(e) = site.db.truncate(name).await {
        log.warn(format!("Table {} could not be emptied, its rows are not restored: {}", name, e))
            .await;
        summary.skipped_tables.push(name.clone());
        for doc in docs {
            if let Err(e) = fs::remove_file(doc) {
                tracing::warn!("Could not delete {}: {}", doc.display(), e);
            }
        }
        return;
    }

    let mut inserted = 0u64;
    for doc in docs {
        match read_table_document(doc) {
            Ok((header, rows)) => {
                let id_pos = header.iter().position(|f| f == "id");
                for (n, row) in rows.into_iter().enumerate() {
                    let outcome = match &row {
                        Value::Array(values) => site.db.insert_raw(name, &header, values).await,
                        other => Err(VaultError::Integrity(format!("row is not an array: {}", other))),
                    };
                    match outcome {
                        Ok(()) => inserted += 1,
                        Err(e) => {
                            summary.skipped_rows += 1;
                            let label = id_pos
                                .and_then(|p| row.get(p))
                                .map(|id| format!("id {}", id))
                                .unwrap_or_else(|| format!("row {}", n + 1));
                            log.warn(format!("Could not insert {} into {}: {}", label, name, e))
                                .await;
                        }
                    }
                }
            }
            Err(e) => {
                log.warn(format!("Could not read {}: {}", doc.display(), e)).await;
            }
        }
        if let Err(e) = fs::remove_file(doc) {
            tracing::warn!("Could not delete {}: {}", doc.display(), e);
        }
        site.host.extend_timeout();
    }
    summary.rows += inserted;

    let expected_max = backup.sequences.get(name).copied().unwrap_or(0);
    let actual_max = match site.db.max_id(table).await {
        Ok(max) => max,
        Err(e) => {
            log.warn(format!("Could not read highest id of {}: {}", name, e)).await;
            None
        }
    };
    if let Some(change) = sequence_repair(table, expected_max, actual_max) {
        if let Err(e) = site.db.apply_change(&change).await {
            log.warn(format!("Could not reset sequence of {}: {}", name, e)).await;
        }
    }

    if CONFIG_TABLES.contains(&name.as_str()) {
        for entry in backup.overrides.iter().filter(|o| o.applies_to(name)) {
            if let Err(e) = site.db.set_config(entry).await {
                log.warn(format!("Could not apply configuration override {}: {}", entry.name, e))
                    .await;
            }
        }
    }

    log.info(format!("Restored table {}: {} row(s)", name, inserted)).await;
}
