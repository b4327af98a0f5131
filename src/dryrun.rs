// sitevault/src/dryrun.rs
//! Dry-run: downloads only the structure of a backup and runs the restore
//! checks against this site without changing anything.

use crate::backup::operator_details;
use crate::checks::CheckReport;
use crate::errors::{Result, VaultError};
use crate::operation::{MetaKey, Metadata, Operation, OperationId, OperationKind, OperationLog, OperationStatus};
use crate::restore::ensure_registered;
use crate::restore::structure::{fetch_structure, precheck};
use crate::site::Site;
use crate::utils::request_dir;

/// Records a dry-run of `backupkey` and hands it to the task queue.
pub async fn schedule(site: &Site, backupkey: &str) -> Result<Operation> {
    let operation = site
        .registry
        .schedule(
            OperationKind::DryRun,
            Some(backupkey),
            operator_details(&site.settings.operator),
        )
        .await?;
    site.log_for(&operation)
        .info(format!("Dry-run of backup {} scheduled", backupkey))
        .await;
    site.queue.enqueue(OperationKind::DryRun, operation.id).await?;
    Ok(operation)
}

/// Detail key under which the summary of a check is stored.
pub fn check_detail_key(name: &str) -> String {
    format!("check:{}", name)
}

async fn run_checks(site: &Site, backupkey: &str, log: &OperationLog) -> Result<CheckReport> {
    let work = request_dir(&site.settings.temp_root, "dryrun-")
        .map_err(|e| VaultError::FatalLocal(format!("{:#}", e)))?;
    let backup = fetch_structure(site, backupkey, work.path(), log).await?;
    precheck(site, &backup, log).await
}

/// Runs the checks and ends the operation as `finished` when all of them pass
/// and `failed` otherwise. A failed verdict is not an error; the returned
/// operation carries it.
pub async fn execute(site: &Site, id: OperationId) -> Result<Operation> {
    let operation = site.registry.get(id).await?;
    if operation.kind != OperationKind::DryRun || operation.status.is_terminal() {
        return Err(VaultError::InvalidState(format!(
            "{} operation {} is {}",
            operation.kind, id, operation.status
        )));
    }
    let log = site.log_for(&operation);
    let started = match operation.status {
        OperationStatus::Scheduled => match ensure_registered(site).await {
            Ok(()) => site.registry.transition(id, OperationStatus::InProgress).await.map(|_| ()),
            Err(e) => Err(e),
        },
        _ => Ok(()),
    };

    let outcome = match (started, operation.backupkey.as_deref()) {
        (Err(e), _) => Err(e),
        (Ok(()), Some(key)) => run_checks(site, key, &log).await,
        (Ok(()), None) => Err(VaultError::InvalidState(format!("Dry-run {} has no backup key", id))),
    };

    match outcome {
        Ok(report) => {
            let mut details = Metadata::new();
            for (name, result) in &report.results {
                let verdict = if result.success { "passed" } else { "failed" };
                details.set_raw(check_detail_key(name), format!("{}: {}", verdict, result.summary));
            }
            site.registry.merge_details(id, &details).await?;
            if report.success() {
                log.info("All checks passed, the backup can be restored").await;
                site.registry.transition(id, OperationStatus::Finished).await
            } else {
                log.error("The backup cannot be restored on this site").await;
                site.registry.transition(id, OperationStatus::Failed).await
            }
        }
        Err(e) => {
            log.error(format!("Dry-run failed: {}", e)).await;
            site.registry
                .merge_details(id, &Metadata::new().with(MetaKey::Error, e.to_string()))
                .await?;
            site.registry.transition(id, OperationStatus::Failed).await?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup;
    use crate::errors::ErrorClass;
    use crate::operation::OperationRegistry;
    use crate::remote::RemoteStore;
    use crate::test_support::{table, Fixture};
    use serde_json::json;

    async fn backup_key(source: &Fixture) -> Result<String> {
        source.db.create(table("t1", &["name"]), vec![vec![json!(1), json!("a")]]);
        let op = backup::schedule(&source.site).await?;
        Ok(backup::execute(&source.site, op.id).await?.backupkey.expect("backup key"))
    }

    #[tokio::test]
    async fn test_dry_run_verdict_is_stable() -> Result<()> {
        let source = Fixture::new();
        let key = backup_key(&source).await?;
        let dest = Fixture::sharing_remote(&source);

        let mut verdicts = Vec::new();
        for _ in 0..2 {
            let op = schedule(&dest.site, &key).await?;
            let done = execute(&dest.site, op.id).await?;
            verdicts.push((done.status, done.details.get_raw("check:structure").map(str::to_string)));
        }
        assert_eq!(verdicts[0], verdicts[1]);
        assert_eq!(verdicts[0].0, OperationStatus::Finished);
        // read-only: nothing was created on the destination
        assert!(dest.db.applied_changes().is_empty());
        assert!(dest.db.rows("t1").is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_first_failing_check_fails_the_dry_run() -> Result<()> {
        let source = Fixture::new();
        let key = backup_key(&source).await?;
        let dest = Fixture::sharing_remote(&source);
        dest.host.set_free_space(0);

        let op = schedule(&dest.site, &key).await?;
        let done = execute(&dest.site, op.id).await?;
        assert_eq!(done.status, OperationStatus::Failed);
        assert!(done.details.get_raw("check:version").is_some_and(|v| v.starts_with("passed")));
        assert!(done.details.get_raw("check:diskspace").is_some_and(|v| v.starts_with("failed")));
        // checks after the failing one did not run
        assert!(done.details.get_raw("check:structure").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_conflicts_with_a_running_restore() -> Result<()> {
        let fx = Fixture::new();
        fx.scheduled(OperationKind::Restore).await?;
        let err = schedule(&fx.site, "backup1").await.expect_err("conflict");
        assert_eq!(err.class(), ErrorClass::Conflict);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_credentials_fail_the_dry_run() -> Result<()> {
        let source = Fixture::new();
        let key = backup_key(&source).await?;
        let dest = Fixture::sharing_remote(&source);
        let op = schedule(&dest.site, &key).await?;
        *dest.remote.credentials_valid.lock().expect("lock") = false;

        let err = execute(&dest.site, op.id).await.expect_err("credentials");
        assert_eq!(err.class(), ErrorClass::PolicyViolation);
        let failed = dest.registry.get(op.id).await?;
        assert_eq!(failed.status, OperationStatus::Failed);
        assert!(failed.details.get_raw("check:version").is_none());
        assert!(!dest.remote.calls().iter().any(|c| c == "download dbstructure.tar.gz"));
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_needs_restores_enabled() -> Result<()> {
        let source = Fixture::new();
        let key = backup_key(&source).await?;
        let mut dest = Fixture::sharing_remote(&source);
        let op = schedule(&dest.site, &key).await?;
        dest.site.settings.restores_allowed = false;

        let err = execute(&dest.site, op.id).await.expect_err("restores disabled");
        assert_eq!(err.class(), ErrorClass::PolicyViolation);
        assert_eq!(dest.status(op.id).await, OperationStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn test_unfinished_backup_is_rejected() -> Result<()> {
        let fx = Fixture::new();
        // announced but never finished
        let key = fx
            .remote
            .announce(&backup::origin_metadata(&fx.site.settings))
            .await?;

        let op = schedule(&fx.site, &key).await?;
        let err = execute(&fx.site, op.id).await.expect_err("unfinished backup");
        assert_eq!(err.class(), ErrorClass::PolicyViolation);
        assert_eq!(fx.status(op.id).await, OperationStatus::Failed);
        Ok(())
    }
}
