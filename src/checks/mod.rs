//! Prechecks. Each check is independent and read-only. A backup runs its
//! checks before exporting anything; the dry-run runs the restore checks and a
//! restore runs them before touching the site.

use async_trait::async_trait;
use futures::TryStreamExt;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::backup::dataroot::is_excluded;
use crate::config::VaultSettings;
use crate::db::{LiveDatabase, DB_ENGINE};
use crate::errors::{Result, VaultError};
use crate::filestore::FileStore;
use crate::host::Host;
use crate::operation::{MetaKey, Metadata, OperationLog};
use crate::remote::RemoteBackupDescriptor;
use crate::schema::{diff, is_internal_table, DbStructure};
use crate::utils::{directory_size, display_size};

/// Restored data needs room for the downloaded archives and their extraction,
/// and a backup for the exported files and their archives.
pub const DISK_SPACE_FACTOR: u64 = 2;

/// Everything a restore check may look at.
pub struct CheckContext<'a> {
    pub settings: &'a VaultSettings,
    pub descriptor: &'a RemoteBackupDescriptor,
    /// Origin metadata stored inside the structure archive.
    pub origin: &'a Metadata,
    /// Expected structure from the backup.
    pub structure: &'a DbStructure,
    /// Live structure of this site.
    pub actual: &'a DbStructure,
    pub host: &'a dyn Host,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub success: bool,
    pub summary: String,
    pub details: Vec<String>,
}

impl CheckResult {
    pub fn passed(summary: impl Into<String>) -> Self {
        CheckResult {
            success: true,
            summary: summary.into(),
            details: Vec::new(),
        }
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        CheckResult {
            success: false,
            summary: summary.into(),
            details: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }
}

/// A named check over a context `C`.
#[async_trait]
pub trait Check<C: Sync>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &C) -> Result<CheckResult>;
}

/// The origin must not be newer than this site, nor older than the oldest
/// version this site accepts.
pub struct VersionCheck;

#[async_trait]
impl<'a> Check<CheckContext<'a>> for VersionCheck {
    fn name(&self) -> &'static str {
        "version"
    }

    async fn run(&self, ctx: &CheckContext<'a>) -> Result<CheckResult> {
        let Some(raw) = ctx
            .origin
            .get(MetaKey::Version)
            .or_else(|| ctx.descriptor.metadata.get(MetaKey::Version))
        else {
            return Ok(CheckResult::failed("Backup does not record the origin version"));
        };
        let Ok(origin) = Decimal::from_str(raw.trim()) else {
            return Ok(CheckResult::failed(format!("Unreadable origin version '{}'", raw)));
        };
        let site = ctx.settings.site_version;

        if origin > site {
            return Ok(CheckResult::failed(format!(
                "Backup was made on version {}, which is newer than this site ({})",
                origin, site
            )));
        }
        if let Some(min) = ctx.settings.min_restore_version {
            if origin < min {
                return Ok(CheckResult::failed(format!(
                    "Backup version {} is older than the minimum restorable version {}",
                    origin, min
                )));
            }
        }
        Ok(CheckResult::passed(format!(
            "Backup version {} can be restored on version {}",
            origin, site
        )))
    }
}

/// Enough free space under dataroot to download and unpack the backup.
pub struct DiskSpaceCheck;

#[async_trait]
impl<'a> Check<CheckContext<'a>> for DiskSpaceCheck {
    fn name(&self) -> &'static str {
        "diskspace"
    }

    async fn run(&self, ctx: &CheckContext<'a>) -> Result<CheckResult> {
        let required = ctx.descriptor.size_bytes.saturating_mul(DISK_SPACE_FACTOR);
        let available = ctx.host.free_disk_space(&ctx.settings.dataroot)?;
        let summary = format!(
            "{} required, {} available",
            display_size(required),
            display_size(available)
        );
        if available < required {
            return Ok(CheckResult::failed(format!("Not enough disk space: {}", summary)));
        }
        Ok(CheckResult::passed(summary))
    }
}

/// The backup comes from the same database engine.
pub struct DbEngineCheck;

#[async_trait]
impl<'a> Check<CheckContext<'a>> for DbEngineCheck {
    fn name(&self) -> &'static str {
        "dbengine"
    }

    async fn run(&self, ctx: &CheckContext<'a>) -> Result<CheckResult> {
        match ctx.origin.get(MetaKey::DbEngine) {
            Some(DB_ENGINE) => Ok(CheckResult::passed(format!("Database engine is {}", DB_ENGINE))),
            Some(other) => Ok(CheckResult::failed(format!(
                "Backup was made on {}, this site runs {}",
                other, DB_ENGINE
            ))),
            None => Ok(CheckResult::failed("Backup does not record its database engine")),
        }
    }
}

/// Reports which tables the restore will have to alter.
pub struct StructureCheck;

#[async_trait]
impl<'a> Check<CheckContext<'a>> for StructureCheck {
    fn name(&self) -> &'static str {
        "structure"
    }

    async fn run(&self, ctx: &CheckContext<'a>) -> Result<CheckResult> {
        let tables: Vec<_> = ctx.structure.backup_tables().collect();
        if tables.is_empty() {
            return Ok(CheckResult::failed("Backup contains no tables"));
        }
        let mut details = Vec::new();
        for table in &tables {
            match diff(table, ctx.actual.tables.get(&table.name), &ctx.settings.preserve_columns) {
                Some(script) if ctx.actual.tables.contains_key(&table.name) => {
                    details.push(format!("{}: {} change(s)", table.name, script.len()))
                }
                Some(_) => details.push(format!("{}: will be created", table.name)),
                None => {}
            }
        }
        let summary = if details.is_empty() {
            format!("{} tables match this site", tables.len())
        } else {
            format!("{} of {} tables will be modified", details.len(), tables.len())
        };
        Ok(CheckResult::passed(summary).with_details(details))
    }
}

/// Checks run by both the dry-run and the restore, in order.
pub fn restore_checks<'a>() -> Vec<Box<dyn Check<CheckContext<'a>>>> {
    vec![
        Box::new(VersionCheck),
        Box::new(DbEngineCheck),
        Box::new(DiskSpaceCheck),
        Box::new(StructureCheck),
    ]
}

/// Everything a backup check may look at.
pub struct BackupCheckContext<'a> {
    pub settings: &'a VaultSettings,
    pub db: &'a dyn LiveDatabase,
    pub files: &'a dyn FileStore,
    pub host: &'a dyn Host,
}

/// The database answers and its tables can be listed.
pub struct DbStatusCheck;

#[async_trait]
impl<'a> Check<BackupCheckContext<'a>> for DbStatusCheck {
    fn name(&self) -> &'static str {
        "dbstatus"
    }

    async fn run(&self, ctx: &BackupCheckContext<'a>) -> Result<CheckResult> {
        match ctx.db.describe_tables().await {
            Ok(tables) => {
                let exported = tables.keys().filter(|name| !is_internal_table(name)).count();
                Ok(CheckResult::passed(format!("Database is up, {} table(s) to export", exported)))
            }
            Err(e) => Ok(CheckResult::failed(format!("Database is not usable: {}", e))),
        }
    }
}

/// Enough free space in the temp root for the exported data and its archives.
pub struct ExportSpaceCheck;

impl ExportSpaceCheck {
    /// Database, backed-up dataroot and distinct file store content.
    async fn estimate(ctx: &BackupCheckContext<'_>) -> Result<u64> {
        let database = ctx.db.size_bytes().await?;
        let dataroot = directory_size(&ctx.settings.dataroot, |relative| !is_excluded(relative))?;
        let files: u64 = ctx
            .files
            .distinct_contents()
            .try_fold(0u64, |total, entry| async move { Ok::<_, VaultError>(total + entry.size) })
            .await?;
        Ok(database + dataroot + files)
    }
}

#[async_trait]
impl<'a> Check<BackupCheckContext<'a>> for ExportSpaceCheck {
    fn name(&self) -> &'static str {
        "diskspace"
    }

    async fn run(&self, ctx: &BackupCheckContext<'a>) -> Result<CheckResult> {
        let required = Self::estimate(ctx).await?.saturating_mul(DISK_SPACE_FACTOR);
        let available = ctx.host.free_disk_space(&ctx.settings.temp_root)?;
        let summary = format!(
            "{} required, {} available",
            display_size(required),
            display_size(available)
        );
        if available < required {
            return Ok(CheckResult::failed(format!("Not enough disk space: {}", summary)));
        }
        Ok(CheckResult::passed(summary))
    }
}

/// Checks run before a backup exports anything, in order.
pub fn backup_checks<'a>() -> Vec<Box<dyn Check<BackupCheckContext<'a>>>> {
    vec![Box::new(DbStatusCheck), Box::new(ExportSpaceCheck)]
}

/// Outcome of running a list of checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub results: Vec<(&'static str, CheckResult)>,
}

impl CheckReport {
    pub fn success(&self) -> bool {
        self.results.iter().all(|(_, r)| r.success)
    }

    pub fn first_failure(&self) -> Option<(&'static str, &CheckResult)> {
        self.results
            .iter()
            .find(|(_, r)| !r.success)
            .map(|(name, r)| (*name, r))
    }
}

/// Runs checks in order and stops at the first one that does not pass. A
/// check that errors counts as failed.
pub async fn run_checks<C: Sync>(
    checks: &[Box<dyn Check<C>>],
    ctx: &C,
    log: &OperationLog,
) -> CheckReport {
    let mut results = Vec::new();
    for check in checks {
        let result = match check.run(ctx).await {
            Ok(result) => result,
            Err(e) => CheckResult::failed(format!("Check could not run: {}", e)),
        };
        if result.success {
            log.info(format!("Check '{}' passed: {}", check.name(), result.summary)).await;
        } else {
            log.error(format!("Check '{}' failed: {}", check.name(), result.summary)).await;
        }
        for line in &result.details {
            log.info(format!("  {}", line)).await;
        }
        let stop = !result.success;
        results.push((check.name(), result));
        if stop {
            break;
        }
    }
    CheckReport { results }
}
