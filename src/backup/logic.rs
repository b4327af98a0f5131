// sitevault/src/backup/logic.rs
use std::path::Path;

use super::dataroot::export_dataroot;
use super::db_export::{export_structure, export_tables};
use crate::checks::{backup_checks, run_checks, BackupCheckContext};
use crate::config::{Operator, VaultSettings};
use crate::db::DB_ENGINE;
use crate::errors::{Result, VaultError};
use crate::filestore::export_filedir;
use crate::operation::{
    MetaKey, Metadata, Operation, OperationId, OperationKind, OperationLog, OperationStatus,
};
use crate::pipeline::Pipeline;
use crate::remote::{Phase, RemoteStatus};
use crate::site::Site;
use crate::utils::archive::pack_directory;
use crate::utils::{display_size, remove_recursively, request_dir};

/// Operator identity stored in the details of every operation they trigger.
pub fn operator_details(operator: &Operator) -> Metadata {
    Metadata::new()
        .with(MetaKey::UserId, operator.id.clone())
        .with(MetaKey::Username, operator.username.clone())
        .with(MetaKey::Fullname, operator.fullname.clone())
        .with(MetaKey::Email, operator.email.clone())
}

/// Describes this site to the remote store and inside the backup itself.
pub fn origin_metadata(settings: &VaultSettings) -> Metadata {
    Metadata::new()
        .with(MetaKey::WwwRoot, settings.site_url.clone())
        .with(MetaKey::DbEngine, DB_ENGINE)
        .with(MetaKey::Version, settings.site_version.to_string())
        .with(MetaKey::VaultVersion, env!("CARGO_PKG_VERSION"))
        .with(MetaKey::Email, settings.operator.email.clone())
        .with(MetaKey::Name, settings.operator.fullname.clone())
}

/// Records a new backup and hands it to the task queue.
///
/// Fails with `Conflict` while another backup is scheduled or running.
pub async fn schedule(site: &Site) -> Result<Operation> {
    let operation = site
        .registry
        .schedule(
            OperationKind::Backup,
            None,
            operator_details(&site.settings.operator),
        )
        .await?;
    site.log_for(&operation).info("Backup scheduled").await;
    site.queue.enqueue(OperationKind::Backup, operation.id).await?;
    Ok(operation)
}

/// Moves the backup to `in_progress` and obtains its remote key.
///
/// A resumed backup keeps the key it already has. If the remote refuses the
/// backup, it ends as `failed_to_start`.
async fn start(site: &Site, operation: &Operation, log: &OperationLog) -> Result<String> {
    if operation.status == OperationStatus::Scheduled {
        site.registry
            .transition(operation.id, OperationStatus::InProgress)
            .await?;
    }
    if let Some(key) = &operation.backupkey {
        log.info(format!("Resuming backup {}", key)).await;
        return Ok(key.clone());
    }

    let announced = match site.remote() {
        Ok(remote) => remote.announce(&origin_metadata(&site.settings)).await,
        Err(e) => Err(e),
    };
    match announced {
        Ok(key) => {
            site.registry.set_backupkey(operation.id, &key).await?;
            log.info(format!("Backup key {} assigned", key)).await;
            Ok(key)
        }
        Err(e) => {
            log.error(format!("Backup could not start: {}", e)).await;
            site.registry
                .merge_details(operation.id, &Metadata::new().with(MetaKey::Error, e.to_string()))
                .await?;
            site.registry
                .transition(operation.id, OperationStatus::FailedToStart)
                .await?;
            Err(e)
        }
    }
}

/// Runs a scheduled (or resumes an in-progress) backup to completion.
pub async fn execute(site: &Site, id: OperationId) -> Result<Operation> {
    let operation = site.registry.get(id).await?;
    if operation.kind != OperationKind::Backup || operation.status.is_terminal() {
        return Err(VaultError::InvalidState(format!(
            "{} operation {} is {}",
            operation.kind, id, operation.status
        )));
    }
    let log = site.log_for(&operation);
    let backupkey = start(site, &operation, &log).await?;

    let outcome = match request_dir(&site.settings.temp_root, "backup-") {
        Ok(work) => run_phases(site, &backupkey, work.path(), &log).await,
        Err(e) => Err(VaultError::FatalLocal(format!("{:#}", e))),
    };
    let outcome = match outcome {
        Ok(total) => site
            .remote()?
            .patch_status(&backupkey, RemoteStatus::Finished)
            .await
            .map(|_| total),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(total) => {
            log.info(format!("Total size of backup: {}", display_size(total))).await;
            log.info("Backup finished").await;
            site.registry.transition(id, OperationStatus::Finished).await
        }
        Err(e) => {
            log.error(format!("Backup failed: {}", e)).await;
            if let Ok(remote) = site.remote() {
                if let Err(patch_err) = remote.patch_status(&backupkey, RemoteStatus::Failed).await {
                    log.warn(format!("Could not mark remote backup as failed: {}", patch_err))
                        .await;
                }
            }
            site.registry
                .merge_details(id, &Metadata::new().with(MetaKey::Error, e.to_string()))
                .await?;
            site.registry.transition(id, OperationStatus::Failed).await?;
            Err(e)
        }
    }
}

/// Database status and disk space. A failing check stops the backup before
/// anything is exported.
async fn precheck(site: &Site, log: &OperationLog) -> Result<()> {
    let ctx = BackupCheckContext {
        settings: &site.settings,
        db: site.db.as_ref(),
        files: site.files.as_ref(),
        host: site.host.as_ref(),
    };
    let report = run_checks(&backup_checks(), &ctx, log).await;
    match report.first_failure() {
        Some((name, result)) => Err(VaultError::PolicyViolation(format!(
            "Check '{}' failed: {}",
            name, result.summary
        ))),
        None => Ok(()),
    }
}

/// The prechecks, then the four export+upload phases, strictly in order.
/// Returns the uploaded total.
async fn run_phases(site: &Site, backupkey: &str, work: &Path, log: &OperationLog) -> Result<u64> {
    let mut pipeline = Pipeline::new(log);
    let mut total = 0u64;

    pipeline.must("Prechecks", precheck(site, log)).await?;

    let structure_dir = work.join("dbstructure");
    let export = pipeline
        .must("Database structure export", async {
            let export = export_structure(site, &structure_dir, &origin_metadata(&site.settings)).await?;
            log.info(format!("Database structure recorded for {} table(s)", export.tables.len()))
                .await;
            Ok(export)
        })
        .await?;
    total += pipeline
        .must(
            "Database structure upload",
            upload_dir(site, backupkey, Phase::DbStructure, &structure_dir, work, log),
        )
        .await?;

    let dump_dir = work.join("dbdump");
    pipeline
        .must("Database export", async {
            let rows = export_tables(site, &export, &dump_dir, log).await?;
            log.info(format!("Exported {} row(s)", rows)).await;
            Ok(())
        })
        .await?;
    total += pipeline
        .must(
            "Database upload",
            upload_dir(site, backupkey, Phase::DbDump, &dump_dir, work, log),
        )
        .await?;

    total += pipeline
        .must("Dataroot export", async {
            let archive = work.join(Phase::Dataroot.file_name());
            export_dataroot(&site.settings.dataroot, &archive).await?;
            upload_archive(site, backupkey, Phase::Dataroot, &archive, log).await
        })
        .await?;

    total += pipeline
        .must("File storage export", async {
            let archive = work.join(Phase::Filedir.file_name());
            let summary = export_filedir(
                site.files.as_ref(),
                site.host.as_ref(),
                &work.join("filedir"),
                &archive,
                log,
            )
            .await?;
            log.info(format!("Packed {} distinct file(s)", summary.blobs)).await;
            upload_archive(site, backupkey, Phase::Filedir, &archive, log).await
        })
        .await?;

    Ok(total)
}

async fn upload_dir(
    site: &Site,
    backupkey: &str,
    phase: Phase,
    dir: &Path,
    work: &Path,
    log: &OperationLog,
) -> Result<u64> {
    let archive = work.join(phase.file_name());
    pack_directory(dir, &archive, |_| true).await?;
    remove_recursively(dir)?;
    upload_archive(site, backupkey, phase, &archive, log).await
}

async fn upload_archive(
    site: &Site,
    backupkey: &str,
    phase: Phase,
    archive: &Path,
    log: &OperationLog,
) -> Result<u64> {
    site.host.extend_timeout();
    let size = site.remote()?.upload(backupkey, phase, archive).await?;
    log.info(format!("Uploaded {} ({})", phase, display_size(size))).await;
    tokio::fs::remove_file(archive).await?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorClass;
    use crate::operation::{LogLevel, OperationRegistry};
    use crate::test_support::{table, Fixture};
    use serde_json::json;

    #[tokio::test]
    async fn test_second_schedule_is_a_conflict() -> Result<()> {
        let fx = Fixture::new();
        let first = schedule(&fx.site).await?;
        let err = schedule(&fx.site).await.expect_err("second backup must be rejected");
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert_eq!(fx.registry.count(), 1);
        assert_eq!(
            *fx.queue.queued.lock().expect("lock"),
            vec![(OperationKind::Backup, first.id)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_backup_uploads_phases_in_order() -> Result<()> {
        let fx = Fixture::new();
        fx.db.create(table("t1", &["name"]), vec![vec![json!(1), json!("a")]]);
        std::fs::create_dir_all(fx.dataroot().join("lang"))?;
        std::fs::write(fx.dataroot().join("lang/strings.txt"), "x")?;
        fx.files.add_file("f", b"content");

        let op = schedule(&fx.site).await?;
        let done = execute(&fx.site, op.id).await?;
        assert_eq!(done.status, OperationStatus::Finished);
        assert!(done.timefinished.is_some());

        let key = fx.registry.get(op.id).await?.backupkey.expect("backup key");
        assert_eq!(
            fx.remote.calls(),
            vec![
                format!("announce {}", key),
                "upload dbstructure.tar.gz".to_string(),
                "upload dbdump.tar.gz".to_string(),
                "upload dataroot.tar.gz".to_string(),
                "upload filedir.tar.gz".to_string(),
                "status finished".to_string(),
            ]
        );
        let descriptor = fx.remote.descriptor(&key).expect("descriptor");
        assert_eq!(descriptor.status, RemoteStatus::Finished);
        assert_eq!(descriptor.metadata.get(MetaKey::DbEngine), Some(DB_ENGINE));
        assert!(fx
            .registry
            .messages(op.id, LogLevel::Info)
            .iter()
            .any(|m| m.starts_with("Total size of backup")));
        // work directory is cleaned up
        assert_eq!(std::fs::read_dir(&fx.site.settings.temp_root)?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_phase_stops_the_backup() -> Result<()> {
        let fx = Fixture::new();
        fx.db.create(table("t1", &["name"]), vec![]);
        fx.remote.fail_upload_of(Phase::DbDump);

        let op = schedule(&fx.site).await?;
        assert!(execute(&fx.site, op.id).await.is_err());
        let failed = fx.registry.get(op.id).await?;
        assert_eq!(failed.status, OperationStatus::Failed);
        assert!(failed.timefailed.is_some());
        assert!(failed.details.get(MetaKey::Error).is_some());

        let calls = fx.remote.calls();
        assert!(!calls.iter().any(|c| c.contains("dataroot")));
        assert_eq!(calls.last().map(String::as_str), Some("status failed"));
        Ok(())
    }

    #[tokio::test]
    async fn test_quota_rejection_fails_to_start() -> Result<()> {
        let fx = Fixture::new();
        *fx.remote.quota.lock().expect("lock") = Some(0);
        let op = schedule(&fx.site).await?;
        let err = execute(&fx.site, op.id).await.expect_err("quota");
        assert_eq!(err.class(), ErrorClass::PolicyViolation);
        assert_eq!(fx.status(op.id).await, OperationStatus::FailedToStart);
        // A new backup may be scheduled afterwards.
        schedule(&fx.site).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_precheck_exports_nothing() -> Result<()> {
        let fx = Fixture::new();
        fx.db.create(table("t1", &["name"]), vec![vec![json!(1), json!("a")]]);
        fx.host.set_free_space(0);

        let op = schedule(&fx.site).await?;
        let err = execute(&fx.site, op.id).await.expect_err("not enough disk space");
        assert_eq!(err.class(), ErrorClass::PolicyViolation);

        let failed = fx.registry.get(op.id).await?;
        assert_eq!(failed.status, OperationStatus::Failed);
        let key = failed.backupkey.expect("backup key");
        assert_eq!(
            fx.remote.calls(),
            vec![format!("announce {}", key), "status failed".to_string()]
        );
        for phase in Phase::ALL {
            assert!(!fx.remote.has_phase(&key, phase));
        }
        assert!(fx
            .registry
            .messages(op.id, LogLevel::Error)
            .iter()
            .any(|m| m.starts_with("Check 'diskspace' failed")));
        Ok(())
    }
}
