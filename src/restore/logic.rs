// sitevault/src/restore/logic.rs
use chrono::Utc;
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;

use super::dataroot::{stage_dataroot, swap_dataroot};
use super::db_restore::restore_database;
use super::structure::{fetch_structure, precheck, BackupStructure};
use super::upgrade::upgrade_after_restore;
use crate::backup::operator_details;
use crate::errors::{Result, VaultError};
use crate::filestore::import_filedir;
use crate::operation::{MetaKey, Metadata, Operation, OperationId, OperationKind, OperationLog, OperationStatus};
use crate::pipeline::{Pipeline, StepPolicy};
use crate::remote::Phase;
use crate::site::Site;
use crate::utils::archive::unpack_archive;
use crate::utils::{display_size, remove_recursively, request_dir};

fn ensure_restores_allowed(site: &Site) -> Result<()> {
    if !site.settings.restores_allowed {
        return Err(VaultError::PolicyViolation(
            "Restores are not allowed on this site".into(),
        ));
    }
    Ok(())
}

/// Records a restore of `backupkey` and hands it to the task queue.
pub async fn schedule(site: &Site, backupkey: &str) -> Result<Operation> {
    ensure_restores_allowed(site)?;
    let operation = site
        .registry
        .schedule(
            OperationKind::Restore,
            Some(backupkey),
            operator_details(&site.settings.operator),
        )
        .await?;
    site.log_for(&operation)
        .info(format!("Restore of backup {} scheduled", backupkey))
        .await;
    site.queue.enqueue(OperationKind::Restore, operation.id).await?;
    Ok(operation)
}

/// Restores must be enabled and the remote must accept this site's key.
/// Checked before a restore or a dry-run starts.
pub async fn ensure_registered(site: &Site) -> Result<()> {
    ensure_restores_allowed(site)?;
    if site.settings.api_key.as_deref().unwrap_or_default().is_empty() {
        return Err(VaultError::PolicyViolation("No API key is configured".into()));
    }
    site.remote()?.check_credentials().await.map_err(|e| {
        VaultError::PolicyViolation(format!("Remote storage rejected the API key: {}", e))
    })?;
    Ok(())
}

async fn start(site: &Site, operation: &Operation) -> Result<()> {
    ensure_registered(site).await?;
    site.registry
        .transition(operation.id, OperationStatus::InProgress)
        .await?;
    Ok(())
}

async fn fail(site: &Site, id: OperationId, log: &OperationLog, error: &VaultError) -> Result<()> {
    log.error(format!("Restore failed: {}", error)).await;
    site.registry
        .merge_details(id, &Metadata::new().with(MetaKey::Error, error.to_string()))
        .await?;
    site.registry.transition(id, OperationStatus::Failed).await?;
    Ok(())
}

/// Runs a scheduled (or resumes an in-progress) restore to completion.
///
/// Until the point of no return any failure fails the restore and leaves the
/// site untouched. After it, failing steps are logged and the remaining steps
/// still run.
pub async fn execute(site: &Site, id: OperationId) -> Result<Operation> {
    let operation = site.registry.get(id).await?;
    if operation.kind != OperationKind::Restore || operation.status.is_terminal() {
        return Err(VaultError::InvalidState(format!(
            "{} operation {} is {}",
            operation.kind, id, operation.status
        )));
    }
    let log = site.log_for(&operation);
    let Some(backupkey) = operation.backupkey.clone() else {
        let e = VaultError::InvalidState(format!("Restore {} has no backup key", id));
        fail(site, id, &log, &e).await?;
        return Err(e);
    };

    if operation.status == OperationStatus::Scheduled {
        if let Err(e) = start(site, &operation).await {
            fail(site, id, &log, &e).await?;
            return Err(e);
        }
        log.info(format!("Restore of backup {} started", backupkey)).await;
    } else {
        log.info(format!("Resuming restore of backup {}", backupkey)).await;
    }

    let mut pipeline = Pipeline::new(&log);
    let outcome = match request_dir(&site.settings.temp_root, "restore-") {
        Ok(work) => run_steps(site, &operation, &backupkey, work.path(), &log, &mut pipeline).await,
        Err(e) => Err(VaultError::FatalLocal(format!("{:#}", e))),
    };

    match outcome {
        Ok(()) => {
            let failed = pipeline.failed_steps();
            if !failed.is_empty() {
                log.warn(format!(
                    "Restore completed with {} failed step(s): {}",
                    failed.len(),
                    failed.join(", ")
                ))
                .await;
            }
            log.info("Restore finished").await;
            site.registry.transition(id, OperationStatus::Finished).await
        }
        Err(e) => {
            fail(site, id, &log, &e).await?;
            Err(e)
        }
    }
}

fn origin_version(backup: &BackupStructure) -> Option<Decimal> {
    backup
        .origin
        .get(MetaKey::Version)
        .or_else(|| backup.descriptor.metadata.get(MetaKey::Version))
        .and_then(|v| Decimal::from_str(v.trim()).ok())
}

async fn run_steps(
    site: &Site,
    operation: &Operation,
    backupkey: &str,
    work: &Path,
    log: &OperationLog,
    pipeline: &mut Pipeline<'_>,
) -> Result<()> {
    let resumed = operation.details.get(MetaKey::PointOfNoReturn).is_some();

    let backup = pipeline
        .must("Backup structure download", fetch_structure(site, backupkey, work, log))
        .await?;

    if resumed {
        log.info("Point of no return already passed, prechecks skipped").await;
    } else {
        pipeline
            .must("Prechecks", async {
                let report = precheck(site, &backup, log).await?;
                match report.first_failure() {
                    Some((name, result)) => Err(VaultError::PolicyViolation(format!(
                        "Check '{}' failed: {}",
                        name, result.summary
                    ))),
                    None => Ok(()),
                }
            })
            .await?;
    }

    let staging = pipeline
        .must("Dataroot download", async {
            let archive = work.join(Phase::Dataroot.file_name());
            let size = site.remote()?.download(backupkey, Phase::Dataroot, &archive).await?;
            log.info(format!("Downloaded {} ({})", Phase::Dataroot, display_size(size))).await;
            let staging = stage_dataroot(&archive, &site.settings.dataroot).await?;
            tokio::fs::remove_file(&archive).await?;
            Ok(staging)
        })
        .await?;

    if !resumed {
        site.registry
            .merge_details(
                operation.id,
                &Metadata::new().with(MetaKey::PointOfNoReturn, Utc::now().to_rfc3339()),
            )
            .await?;
    }
    log.info("Point of no return reached").await;
    pipeline.set_policy(StepPolicy::ContinueOnError);

    pipeline.step("Terminating sessions", site.host.kill_all_sessions()).await?;

    pipeline
        .step("Database restore", async {
            let archive = work.join(Phase::DbDump.file_name());
            let size = site.remote()?.download(backupkey, Phase::DbDump, &archive).await?;
            log.info(format!("Downloaded {} ({})", Phase::DbDump, display_size(size))).await;
            let dump_dir = work.join("dbdump");
            unpack_archive(&archive, &dump_dir).await?;
            tokio::fs::remove_file(&archive).await?;
            let summary = restore_database(site, &dump_dir, &backup, log).await?;
            log.info(format!(
                "Restored {} row(s) in {} table(s), {} row(s) skipped",
                summary.rows, summary.tables, summary.skipped_rows
            ))
            .await;
            remove_recursively(&dump_dir)?;
            Ok(())
        })
        .await?;

    pipeline
        .step("Upgrade", upgrade_after_restore(site, origin_version(&backup), log))
        .await?;

    pipeline
        .step("Dataroot restore", async {
            let report = swap_dataroot(&staging, &site.settings.dataroot, remove_recursively)?;
            for (name, reason) in &report.failed {
                log.warn(format!("Dataroot entry {} was not restored: {}", name, reason))
                    .await;
            }
            log.info(format!("Restored {} dataroot entries", report.replaced.len())).await;
            Ok(())
        })
        .await?;

    pipeline
        .step("File storage restore", async {
            let archive = work.join(Phase::Filedir.file_name());
            let size = site.remote()?.download(backupkey, Phase::Filedir, &archive).await?;
            log.info(format!("Downloaded {} ({})", Phase::Filedir, display_size(size))).await;
            let summary = import_filedir(
                site.files.as_ref(),
                site.host.as_ref(),
                &archive,
                &work.join("filedir"),
                log,
            )
            .await?;
            tokio::fs::remove_file(&archive).await?;
            log.info(format!(
                "Restored {} file(s), {} skipped, {} failed",
                summary.registered, summary.skipped, summary.failed
            ))
            .await;
            Ok(())
        })
        .await?;

    pipeline.step("Purging caches", site.host.purge_caches()).await?;
    pipeline.step("Terminating sessions", site.host.kill_all_sessions()).await?;
    Ok(())
}
