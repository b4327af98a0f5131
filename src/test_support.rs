//! In-memory collaborators for exercising the pipelines without Postgres or S3.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use crate::config::VaultSettings;
use crate::db::LiveDatabase;
use crate::errors::{Result, VaultError};
use crate::filestore::local::sha256_file;
use crate::filestore::{ContentEntry, FileStore};
use crate::host::Host;
use crate::operation::{
    LogEntry, LogLevel, Metadata, Operation, OperationId, OperationKind, OperationRegistry,
    OperationStatus,
};
use crate::remote::{Phase, RemoteBackupDescriptor, RemoteStatus, RemoteStore};
use crate::restore::upgrade::UpgradeRegistry;
use crate::schema::{ConfigOverride, FieldDescriptor, FieldType, SchemaChange, TableDescriptor};
use crate::site::{Site, TaskQueue};

/// A table with a sequence `id` column followed by nullable text columns.
pub fn table(name: &str, columns: &[&str]) -> TableDescriptor {
    let mut fields = vec![FieldDescriptor {
        name: "id".into(),
        field_type: FieldType::Int { bytes: 8 },
        notnull: true,
        default: None,
        sequence: true,
    }];
    fields.extend(columns.iter().map(|c| FieldDescriptor {
        name: (*c).to_string(),
        field_type: FieldType::Text,
        notnull: false,
        default: None,
        sequence: false,
    }));
    TableDescriptor {
        name: name.into(),
        fields,
        indexes: Vec::new(),
    }
}

struct MemTable {
    descriptor: TableDescriptor,
    rows: Vec<Vec<Value>>,
}

#[derive(Default)]
pub struct MemoryDatabase {
    tables: Mutex<BTreeMap<String, MemTable>>,
    config: Mutex<BTreeMap<(Option<String>, String), String>>,
    sequences: Mutex<BTreeMap<String, i64>>,
    changes: Mutex<Vec<SchemaChange>>,
    failing_changes: Mutex<BTreeSet<String>>,
}

impl MemoryDatabase {
    pub fn create(&self, descriptor: TableDescriptor, rows: Vec<Vec<Value>>) {
        self.tables
            .lock()
            .expect("lock")
            .insert(descriptor.name.clone(), MemTable { descriptor, rows });
    }

    pub fn rows(&self, table: &str) -> Vec<Vec<Value>> {
        self.tables
            .lock()
            .expect("lock")
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn descriptor(&self, table: &str) -> Option<TableDescriptor> {
        self.tables
            .lock()
            .expect("lock")
            .get(table)
            .map(|t| t.descriptor.clone())
    }

    pub fn config_value(&self, plugin: Option<&str>, name: &str) -> Option<String> {
        self.config
            .lock()
            .expect("lock")
            .get(&(plugin.map(str::to_string), name.to_string()))
            .cloned()
    }

    pub fn next_sequence_value(&self, table: &str) -> Option<i64> {
        self.sequences.lock().expect("lock").get(table).copied()
    }

    pub fn applied_changes(&self) -> Vec<SchemaChange> {
        self.changes.lock().expect("lock").clone()
    }

    /// Makes every structural change on `table` fail.
    pub fn fail_changes_on(&self, table: &str) {
        self.failing_changes.lock().expect("lock").insert(table.to_string());
    }
}

#[async_trait]
impl LiveDatabase for MemoryDatabase {
    async fn describe_tables(&self) -> Result<BTreeMap<String, TableDescriptor>> {
        Ok(self
            .tables
            .lock()
            .expect("lock")
            .iter()
            .map(|(name, t)| (name.clone(), t.descriptor.clone()))
            .collect())
    }

    fn stream_rows<'a>(&'a self, table: &'a TableDescriptor) -> BoxStream<'a, Result<Vec<Value>>> {
        let mut rows = self.rows(&table.name);
        let sort = table
            .sort_field()
            .and_then(|f| table.fields.iter().position(|x| x.name == f));
        if let Some(pos) = sort {
            rows.sort_by_key(|r| r.get(pos).and_then(Value::as_i64).unwrap_or(i64::MIN));
        }
        stream::iter(rows.into_iter().map(Ok)).boxed()
    }

    async fn insert_raw(&self, table: &str, fields: &[String], row: &[Value]) -> Result<()> {
        if fields.len() != row.len() {
            return Err(VaultError::Integrity(format!(
                "{} values for {} columns",
                row.len(),
                fields.len()
            )));
        }
        let mut tables = self.tables.lock().expect("lock");
        let target = tables
            .get_mut(table)
            .ok_or_else(|| VaultError::NotFound(format!("table {}", table)))?;
        let mut full = vec![Value::Null; target.descriptor.fields.len()];
        for (name, value) in fields.iter().zip(row) {
            let pos = target
                .descriptor
                .fields
                .iter()
                .position(|f| &f.name == name)
                .ok_or_else(|| VaultError::Integrity(format!("unknown column {}", name)))?;
            full[pos] = value.clone();
        }
        for (field, value) in target.descriptor.fields.iter().zip(&full) {
            if field.notnull && value.is_null() {
                return Err(VaultError::Integrity(format!("{} cannot be null", field.name)));
            }
        }
        target.rows.push(full);
        Ok(())
    }

    async fn truncate(&self, table: &str) -> Result<()> {
        if let Some(t) = self.tables.lock().expect("lock").get_mut(table) {
            t.rows.clear();
        }
        Ok(())
    }

    async fn apply_change(&self, change: &SchemaChange) -> Result<()> {
        if self.failing_changes.lock().expect("lock").contains(change.table()) {
            return Err(VaultError::Integrity(format!("cannot alter {}", change.table())));
        }
        self.changes.lock().expect("lock").push(change.clone());
        let mut tables = self.tables.lock().expect("lock");
        match change {
            SchemaChange::CreateTable { table } => {
                tables.insert(
                    table.name.clone(),
                    MemTable {
                        descriptor: table.clone(),
                        rows: Vec::new(),
                    },
                );
            }
            SchemaChange::AddColumn { table, field } => {
                if let Some(t) = tables.get_mut(table) {
                    t.descriptor.fields.push(field.clone());
                    t.rows.iter_mut().for_each(|r| r.push(Value::Null));
                }
            }
            SchemaChange::ModifyColumn { table, field } => {
                if let Some(t) = tables.get_mut(table) {
                    if let Some(f) = t.descriptor.fields.iter_mut().find(|f| f.name == field.name) {
                        *f = field.clone();
                    }
                }
            }
            SchemaChange::DropColumn { table, column } => {
                if let Some(t) = tables.get_mut(table) {
                    if let Some(pos) = t.descriptor.fields.iter().position(|f| &f.name == column) {
                        t.descriptor.fields.remove(pos);
                        t.rows.iter_mut().for_each(|r| {
                            r.remove(pos);
                        });
                    }
                }
            }
            SchemaChange::AddIndex { table, index } => {
                if let Some(t) = tables.get_mut(table) {
                    t.descriptor.indexes.push(index.clone());
                }
            }
            SchemaChange::DropIndex { table, index } => {
                if let Some(t) = tables.get_mut(table) {
                    t.descriptor.indexes.retain(|i| &i.name != index);
                }
            }
            SchemaChange::ResetSequence { table, next_value, .. } => {
                self.sequences
                    .lock()
                    .expect("lock")
                    .insert(table.clone(), *next_value);
            }
        }
        Ok(())
    }

    async fn max_id(&self, table: &TableDescriptor) -> Result<Option<i64>> {
        let Some(field) = table.sequence_field() else {
            return Ok(None);
        };
        let tables = self.tables.lock().expect("lock");
        let Some(t) = tables.get(&table.name) else {
            return Ok(None);
        };
        let pos = t.descriptor.fields.iter().position(|f| f.name == field.name);
        Ok(pos.and_then(|p| t.rows.iter().filter_map(|r| r[p].as_i64()).max()))
    }

    async fn size_bytes(&self) -> Result<u64> {
        let tables = self.tables.lock().expect("lock");
        Ok(tables
            .values()
            .flat_map(|t| t.rows.iter())
            .map(|row| serde_json::to_string(row).map(|s| s.len() as u64).unwrap_or(0))
            .sum())
    }

    async fn set_config(&self, entry: &ConfigOverride) -> Result<()> {
        self.config
            .lock()
            .expect("lock")
            .insert((entry.plugin.clone(), entry.name.clone()), entry.value.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryFileStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    /// Logical name -> content hash.
    references: Mutex<BTreeMap<String, String>>,
    rejected: Mutex<BTreeSet<String>>,
    registrations: AtomicUsize,
}

impl MemoryFileStore {
    /// Adds a logical file and returns the content hash it points at.
    pub fn add_file(&self, name: &str, content: &[u8]) -> String {
        let hash = {
            use sha2::{Digest, Sha256};
            hex::encode(Sha256::digest(content))
        };
        self.blobs
            .lock()
            .expect("lock")
            .insert(hash.clone(), content.to_vec());
        self.references
            .lock()
            .expect("lock")
            .insert(name.to_string(), hash.clone());
        hash
    }

    pub fn blob(&self, hash: &str) -> Option<Vec<u8>> {
        self.blobs.lock().expect("lock").get(hash).cloned()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().expect("lock").len()
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    /// Makes registration of `hash` fail.
    pub fn reject(&self, hash: &str) {
        self.rejected.lock().expect("lock").insert(hash.to_string());
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    fn distinct_contents(&self) -> BoxStream<'_, Result<ContentEntry>> {
        let hashes: BTreeSet<String> = self.references.lock().expect("lock").values().cloned().collect();
        let blobs = self.blobs.lock().expect("lock");
        let entries: Vec<Result<ContentEntry>> = hashes
            .into_iter()
            .map(|h| {
                let size = blobs.get(&h).map(|b| b.len() as u64).unwrap_or(0);
                Ok(ContentEntry { contenthash: h, size })
            })
            .collect();
        stream::iter(entries).boxed()
    }

    async fn copy_content_to(&self, entry: &ContentEntry, dest: &Path) -> Result<()> {
        let content = self
            .blob(&entry.contenthash)
            .ok_or_else(|| VaultError::Integrity(format!("Blob {} is missing", entry.contenthash)))?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, content)?;
        Ok(())
    }

    async fn add_to_pool(&self, source: &Path, contenthash: &str) -> Result<()> {
        if self.rejected.lock().expect("lock").contains(contenthash) {
            return Err(VaultError::Integrity(format!("Blob {} rejected", contenthash)));
        }
        if sha256_file(source)? != contenthash {
            return Err(VaultError::Integrity(format!("Content of {} does not match", contenthash)));
        }
        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.blobs
            .lock()
            .expect("lock")
            .insert(contenthash.to_string(), fs::read(source)?);
        Ok(())
    }
}

/// Remote store keeping phase archives in a local directory.
pub struct MemoryRemote {
    dir: TempDir,
    descriptors: Mutex<BTreeMap<String, RemoteBackupDescriptor>>,
    pub quota: Mutex<Option<usize>>,
    pub credentials_valid: Mutex<bool>,
    fail_upload: Mutex<Option<Phase>>,
    calls: Mutex<Vec<String>>,
    counter: AtomicU64,
}

impl MemoryRemote {
    pub fn new() -> Self {
        MemoryRemote {
            dir: tempfile::tempdir().expect("tempdir"),
            descriptors: Mutex::new(BTreeMap::new()),
            quota: Mutex::new(None),
            credentials_valid: Mutex::new(true),
            fail_upload: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }

    fn phase_path(&self, backupkey: &str, phase: Phase) -> PathBuf {
        self.dir.path().join(backupkey).join(phase.file_name())
    }

    pub fn fail_upload_of(&self, phase: Phase) {
        *self.fail_upload.lock().expect("lock") = Some(phase);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn descriptor(&self, backupkey: &str) -> Option<RemoteBackupDescriptor> {
        self.descriptors.lock().expect("lock").get(backupkey).cloned()
    }

    pub fn has_phase(&self, backupkey: &str, phase: Phase) -> bool {
        self.phase_path(backupkey, phase).is_file()
    }

    pub fn phase_file(&self, backupkey: &str, phase: Phase) -> PathBuf {
        self.phase_path(backupkey, phase)
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("lock").push(call);
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn check_credentials(&self) -> Result<()> {
        if *self.credentials_valid.lock().expect("lock") {
            Ok(())
        } else {
            Err(VaultError::Transport("403 Forbidden".into()))
        }
    }

    async fn announce(&self, metadata: &Metadata) -> Result<String> {
        let existing = self.descriptors.lock().expect("lock").len();
        if let Some(quota) = *self.quota.lock().expect("lock") {
            if existing >= quota {
                return Err(VaultError::PolicyViolation(format!("Backup quota of {} reached", quota)));
            }
        }
        let key = format!("backup{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);
        self.record(format!("announce {}", key));
        self.descriptors.lock().expect("lock").insert(
            key.clone(),
            RemoteBackupDescriptor {
                backupkey: key.clone(),
                status: RemoteStatus::InProgress,
                timecreated: Utc::now(),
                timefinished: None,
                metadata: metadata.clone(),
                size_bytes: 0,
            },
        );
        Ok(key)
    }

    async fn upload(&self, backupkey: &str, phase: Phase, source: &Path) -> Result<u64> {
        self.record(format!("upload {}", phase));
        if *self.fail_upload.lock().expect("lock") == Some(phase) {
            return Err(VaultError::Transport(format!("503 while uploading {}", phase)));
        }
        let dest = self.phase_path(backupkey, phase);
        fs::create_dir_all(dest.parent().expect("phase parent"))?;
        Ok(fs::copy(source, dest)?)
    }

    async fn download_url(&self, backupkey: &str, phase: Phase) -> Result<String> {
        Ok(format!("file://{}", self.phase_path(backupkey, phase).display()))
    }

    async fn download(&self, backupkey: &str, phase: Phase, dest: &Path) -> Result<u64> {
        self.record(format!("download {}", phase));
        let source = self.phase_path(backupkey, phase);
        if !source.is_file() {
            return Err(VaultError::Transport(format!("404 {}", phase)));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(fs::copy(source, dest)?)
    }

    async fn get_descriptor(&self, backupkey: &str) -> Result<RemoteBackupDescriptor> {
        self.descriptor(backupkey)
            .ok_or_else(|| VaultError::Transport(format!("404 backup {}", backupkey)))
    }

    async fn list(&self) -> Result<Vec<RemoteBackupDescriptor>> {
        let mut all: Vec<_> = self.descriptors.lock().expect("lock").values().cloned().collect();
        all.sort_by(|a, b| b.timecreated.cmp(&a.timecreated));
        Ok(all)
    }

    async fn patch_status(&self, backupkey: &str, status: RemoteStatus) -> Result<()> {
        self.record(format!("status {}", status));
        let size: u64 = Phase::ALL
            .iter()
            .filter_map(|p| fs::metadata(self.phase_path(backupkey, *p)).ok())
            .map(|m| m.len())
            .sum();
        let mut descriptors = self.descriptors.lock().expect("lock");
        let descriptor = descriptors
            .get_mut(backupkey)
            .ok_or_else(|| VaultError::Transport(format!("404 backup {}", backupkey)))?;
        descriptor.status = status;
        if status == RemoteStatus::Finished {
            descriptor.timefinished = Some(Utc::now());
            descriptor.size_bytes = size;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRegistry {
    operations: Mutex<BTreeMap<OperationId, Operation>>,
    logs: Mutex<BTreeMap<OperationId, Vec<LogEntry>>>,
}

impl MemoryRegistry {
    pub fn entries(&self, id: OperationId) -> Vec<LogEntry> {
        self.logs.lock().expect("lock").get(&id).cloned().unwrap_or_default()
    }

    pub fn messages(&self, id: OperationId, level: LogLevel) -> Vec<String> {
        self.entries(id)
            .into_iter()
            .filter(|e| e.level == level)
            .map(|e| e.message)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.operations.lock().expect("lock").len()
    }

    /// Overwrites a stored operation, bypassing transition rules.
    pub fn put(&self, operation: Operation) {
        self.operations.lock().expect("lock").insert(operation.id, operation);
    }
}

#[async_trait]
impl OperationRegistry for MemoryRegistry {
    async fn schedule(
        &self,
        kind: OperationKind,
        backupkey: Option<&str>,
        details: Metadata,
    ) -> Result<Operation> {
        let mut operations = self.operations.lock().expect("lock");
        if let Some(existing) = operations.values().find(|o| {
            kind.conflicting().contains(&o.kind) && OperationStatus::ACTIVE.contains(&o.status)
        }) {
            return Err(VaultError::Conflict(format!(
                "{} operation {} is already {}",
                existing.kind, existing.id, existing.status
            )));
        }
        let now = Utc::now();
        let operation = Operation {
            id: operations.len() as OperationId + 1,
            kind,
            status: OperationStatus::Scheduled,
            backupkey: backupkey.map(str::to_string),
            details,
            timecreated: now,
            timestarted: None,
            timefinished: None,
            timefailed: None,
            timemodified: now,
        };
        operations.insert(operation.id, operation.clone());
        Ok(operation)
    }

    async fn get(&self, id: OperationId) -> Result<Operation> {
        self.operations
            .lock()
            .expect("lock")
            .get(&id)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(format!("Operation {}", id)))
    }

    async fn find(&self, kinds: &[OperationKind], statuses: &[OperationStatus]) -> Result<Vec<Operation>> {
        let mut found: Vec<Operation> = self
            .operations
            .lock()
            .expect("lock")
            .values()
            .filter(|o| kinds.contains(&o.kind))
            .filter(|o| statuses.is_empty() || statuses.contains(&o.status))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.timecreated.cmp(&a.timecreated).then(b.id.cmp(&a.id)));
        Ok(found)
    }

    async fn transition(&self, id: OperationId, status: OperationStatus) -> Result<Operation> {
        let mut operations = self.operations.lock().expect("lock");
        let operation = operations
            .get_mut(&id)
            .ok_or_else(|| VaultError::NotFound(format!("Operation {}", id)))?;
        operation.apply_transition(status, Utc::now())?;
        Ok(operation.clone())
    }

    async fn set_backupkey(&self, id: OperationId, backupkey: &str) -> Result<()> {
        if let Some(op) = self.operations.lock().expect("lock").get_mut(&id) {
            op.backupkey = Some(backupkey.to_string());
        }
        Ok(())
    }

    async fn merge_details(&self, id: OperationId, details: &Metadata) -> Result<()> {
        if let Some(op) = self.operations.lock().expect("lock").get_mut(&id) {
            op.details.merge(details);
        }
        Ok(())
    }

    async fn append_log(&self, id: OperationId, level: LogLevel, message: &str) -> Result<LogEntry> {
        let entry = LogEntry {
            timecreated: Utc::now(),
            level,
            message: message.to_string(),
        };
        self.logs
            .lock()
            .expect("lock")
            .entry(id)
            .or_default()
            .push(entry.clone());
        Ok(entry)
    }

    async fn logs(&self, id: OperationId) -> Result<Vec<LogEntry>> {
        Ok(self.entries(id))
    }
}

pub struct MemoryHost {
    free_space: AtomicU64,
    pub sessions_killed: AtomicUsize,
    pub caches_purged: AtomicUsize,
    pub timeouts_extended: AtomicUsize,
}

impl MemoryHost {
    pub fn set_free_space(&self, bytes: u64) {
        self.free_space.store(bytes, Ordering::SeqCst);
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        MemoryHost {
            free_space: AtomicU64::new(u64::MAX / 4),
            sessions_killed: AtomicUsize::new(0),
            caches_purged: AtomicUsize::new(0),
            timeouts_extended: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Host for MemoryHost {
    async fn kill_all_sessions(&self) -> Result<()> {
        self.sessions_killed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn purge_caches(&self) -> Result<()> {
        self.caches_purged.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn extend_timeout(&self) {
        self.timeouts_extended.fetch_add(1, Ordering::SeqCst);
    }

    fn free_disk_space(&self, _path: &Path) -> Result<u64> {
        Ok(self.free_space.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct RecordingQueue {
    pub queued: Mutex<Vec<(OperationKind, OperationId)>>,
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, kind: OperationKind, id: OperationId) -> Result<()> {
        self.queued.lock().expect("lock").push((kind, id));
        Ok(())
    }
}

/// One fake site: its own dataroot, database, file store and registry.
pub struct Fixture {
    pub dir: TempDir,
    pub db: Arc<MemoryDatabase>,
    pub files: Arc<MemoryFileStore>,
    pub remote: Arc<MemoryRemote>,
    pub registry: Arc<MemoryRegistry>,
    pub host: Arc<MemoryHost>,
    pub queue: Arc<RecordingQueue>,
    pub site: Site,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_remote(Arc::new(MemoryRemote::new()))
    }

    /// A second site that sees the same remote backups as `other`.
    pub fn sharing_remote(other: &Fixture) -> Self {
        Self::with_remote(other.remote.clone())
    }

    fn with_remote(remote: Arc<MemoryRemote>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let dataroot = dir.path().join("dataroot");
        fs::create_dir_all(&dataroot).expect("dataroot");

        let mut settings = VaultSettings::for_dataroot(&dataroot);
        settings.site_url = "https://site.example".into();
        settings.site_version = Decimal::from(2024010100);
        settings.restores_allowed = true;
        settings.api_key = Some("secret".into());
        settings.rows_per_document = 2;

        let db = Arc::new(MemoryDatabase::default());
        let files = Arc::new(MemoryFileStore::default());
        let registry = Arc::new(MemoryRegistry::default());
        let host = Arc::new(MemoryHost::default());
        let queue = Arc::new(RecordingQueue::default());
        let site = Site {
            settings,
            db: db.clone(),
            files: files.clone(),
            remote: Some(remote.clone()),
            registry: registry.clone(),
            host: host.clone(),
            queue: queue.clone(),
            upgrades: Arc::new(UpgradeRegistry::default()),
        };
        Fixture {
            dir,
            db,
            files,
            remote,
            registry,
            host,
            queue,
            site,
        }
    }

    pub fn dataroot(&self) -> &Path {
        &self.site.settings.dataroot
    }

    pub async fn scheduled(&self, kind: OperationKind) -> Result<Operation> {
        self.registry
            .schedule(kind, None, Metadata::new())
            .await
    }

    pub async fn status(&self, id: OperationId) -> OperationStatus {
        self.registry.get(id).await.expect("operation exists").status
    }
}
