//! Operation records: the single long-lived, checkpointed state of every
//! backup, restore and restore pre-check.

pub(crate) mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::errors::{Result, VaultError};

pub use postgres::PgOperationRegistry;

pub type OperationId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Backup,
    Restore,
    DryRun,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Backup => "backup",
            OperationKind::Restore => "restore",
            OperationKind::DryRun => "dryrun",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "backup" => Some(OperationKind::Backup),
            "restore" => Some(OperationKind::Restore),
            "dryrun" => Some(OperationKind::DryRun),
            _ => None,
        }
    }

    /// Kinds that must not be active when an operation of this kind is scheduled.
    pub fn conflicting(self) -> &'static [OperationKind] {
        match self {
            OperationKind::Backup => &[OperationKind::Backup],
            OperationKind::Restore => &[
                OperationKind::Restore,
                OperationKind::DryRun,
                OperationKind::Backup,
            ],
            OperationKind::DryRun => &[OperationKind::Restore, OperationKind::DryRun],
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Scheduled,
    InProgress,
    Finished,
    Failed,
    FailedToStart,
}

impl OperationStatus {
    pub const ACTIVE: [OperationStatus; 2] = [OperationStatus::Scheduled, OperationStatus::InProgress];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Scheduled => "scheduled",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Finished => "finished",
            OperationStatus::Failed => "failed",
            OperationStatus::FailedToStart => "failed_to_start",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(OperationStatus::Scheduled),
            "in_progress" => Some(OperationStatus::InProgress),
            "finished" => Some(OperationStatus::Finished),
            "failed" => Some(OperationStatus::Failed),
            "failed_to_start" => Some(OperationStatus::FailedToStart),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Finished | OperationStatus::Failed | OperationStatus::FailedToStart
        )
    }

    pub fn can_transition_to(self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Scheduled, InProgress)
                | (Scheduled, Failed)
                | (Scheduled, FailedToStart)
                | (InProgress, InProgress)
                | (InProgress, Finished)
                | (InProgress, Failed)
                | (InProgress, FailedToStart)
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "warning" => LogLevel::Warning,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timecreated: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn format_line(&self) -> String {
        let prefix = match self.level {
            LogLevel::Info => String::new(),
            level => format!("{}: ", level.as_str().to_uppercase()),
        };
        format!(
            "[{}] {}{}",
            self.timecreated.format("%Y-%m-%d %H:%M:%S"),
            prefix,
            self.message
        )
    }
}

/// Well-known keys of [`Metadata`]. Anything else goes through the raw accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKey {
    /// Public URL of the site that produced the backup.
    WwwRoot,
    DbEngine,
    /// Application version of the origin site.
    Version,
    VaultVersion,
    Email,
    Name,
    UserId,
    Username,
    Fullname,
    /// Set by a restore once destructive steps have begun.
    PointOfNoReturn,
    /// Error message of the failure that ended the operation.
    Error,
}

impl MetaKey {
    pub fn as_str(self) -> &'static str {
        match self {
            MetaKey::WwwRoot => "wwwroot",
            MetaKey::DbEngine => "dbengine",
            MetaKey::Version => "version",
            MetaKey::VaultVersion => "vaultversion",
            MetaKey::Email => "email",
            MetaKey::Name => "name",
            MetaKey::UserId => "userid",
            MetaKey::Username => "username",
            MetaKey::Fullname => "fullname",
            MetaKey::PointOfNoReturn => "pointofnoreturn",
            MetaKey::Error => "error",
        }
    }
}

/// String map with typed access for the well-known keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: MetaKey) -> Option<&str> {
        self.0.get(key.as_str()).map(String::as_str)
    }

    pub fn set(&mut self, key: MetaKey, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.as_str().to_string(), value.into());
        self
    }

    pub fn with(mut self, key: MetaKey, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set_raw(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Copies every entry of `other` over this map.
    pub fn merge(&mut self, other: &Metadata) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub backupkey: Option<String>,
    pub details: Metadata,
    pub timecreated: DateTime<Utc>,
    pub timestarted: Option<DateTime<Utc>>,
    pub timefinished: Option<DateTime<Utc>>,
    pub timefailed: Option<DateTime<Utc>>,
    pub timemodified: DateTime<Utc>,
}

impl Operation {
    /// Applies a status change and stamps the matching timestamp.
    ///
    /// Terminal statuses are never overwritten.
    pub fn apply_transition(&mut self, next: OperationStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(VaultError::InvalidState(format!(
                "{} {} cannot move from {} to {}",
                self.kind, self.id, self.status, next
            )));
        }
        match next {
            OperationStatus::InProgress if self.status == OperationStatus::Scheduled => {
                self.timestarted = Some(now)
            }
            OperationStatus::Finished => self.timefinished = Some(now),
            OperationStatus::Failed | OperationStatus::FailedToStart => self.timefailed = Some(now),
            _ => {}
        }
        self.status = next;
        self.timemodified = now;
        Ok(())
    }
}

/// Durable store of operations and their logs.
///
/// Uniqueness of active operations is enforced by `schedule` with a
/// check-then-insert; a concurrent second scheduler is rejected, not queued.
#[async_trait]
pub trait OperationRegistry: Send + Sync {
    /// Inserts a new `scheduled` operation unless one of `kind.conflicting()`
    /// is already scheduled or in progress, in which case `Conflict` is returned.
    async fn schedule(
        &self,
        kind: OperationKind,
        backupkey: Option<&str>,
        details: Metadata,
    ) -> Result<Operation>;

    async fn get(&self, id: OperationId) -> Result<Operation>;

    /// Operations of the given kinds and statuses, newest first. Empty
    /// `statuses` matches every status.
    async fn find(&self, kinds: &[OperationKind], statuses: &[OperationStatus]) -> Result<Vec<Operation>>;

    async fn transition(&self, id: OperationId, status: OperationStatus) -> Result<Operation>;

    async fn set_backupkey(&self, id: OperationId, backupkey: &str) -> Result<()>;

    async fn merge_details(&self, id: OperationId, details: &Metadata) -> Result<()>;

    async fn append_log(&self, id: OperationId, level: LogLevel, message: &str) -> Result<LogEntry>;

    /// Full chronological log.
    async fn logs(&self, id: OperationId) -> Result<Vec<LogEntry>>;
}

/// Writes to an operation's durable log and mirrors every line to `tracing`.
#[derive(Clone)]
pub struct OperationLog {
    registry: Arc<dyn OperationRegistry>,
    id: OperationId,
    kind: OperationKind,
}

impl OperationLog {
    pub fn new(registry: Arc<dyn OperationRegistry>, operation: &Operation) -> Self {
        OperationLog {
            registry,
            id: operation.id,
            kind: operation.kind,
        }
    }

    pub async fn add(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => tracing::info!(operation = self.id, kind = %self.kind, "{}", message),
            LogLevel::Warning => tracing::warn!(operation = self.id, kind = %self.kind, "{}", message),
            LogLevel::Error => tracing::error!(operation = self.id, kind = %self.kind, "{}", message),
        }
        if let Err(e) = self.registry.append_log(self.id, level, &message).await {
            tracing::error!(operation = self.id, "Could not persist log line: {}", e);
        }
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.add(LogLevel::Info, message).await
    }

    pub async fn warn(&self, message: impl Into<String>) {
        self.add(LogLevel::Warning, message).await
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.add(LogLevel::Error, message).await
    }
}
