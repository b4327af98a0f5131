// sitevault/src/worker.rs
//! One polling pass over the operation registry.

use crate::errors::Result;
use crate::operation::{Operation, OperationKind, OperationStatus};
use crate::site::Site;
use crate::{backup, dryrun, restore};

/// Kinds that share a worker slot. At most one operation per group runs at a time.
const GROUPS: [&[OperationKind]; 2] = [
    &[OperationKind::Backup],
    &[OperationKind::Restore, OperationKind::DryRun],
];

/// The operation a worker should run next for one group: an interrupted one
/// first, otherwise the oldest scheduled one.
async fn next_in_group(site: &Site, kinds: &[OperationKind]) -> Result<Option<Operation>> {
    let running = site.registry.find(kinds, &[OperationStatus::InProgress]).await?;
    if let Some(op) = running.into_iter().last() {
        return Ok(Some(op));
    }
    let scheduled = site.registry.find(kinds, &[OperationStatus::Scheduled]).await?;
    Ok(scheduled.into_iter().last())
}

async fn dispatch(site: &Site, operation: &Operation) -> Result<Operation> {
    match operation.kind {
        OperationKind::Backup => backup::execute(site, operation.id).await,
        OperationKind::Restore => restore::execute(site, operation.id).await,
        OperationKind::DryRun => dryrun::execute(site, operation.id).await,
    }
}

/// Runs at most one backup and one restore or dry-run, resuming interrupted
/// operations before starting new ones. Returns what was run; an operation
/// that ended in failure is logged, not returned as an error.
pub async fn run_once(site: &Site) -> Result<Vec<Operation>> {
    let mut ran = Vec::new();
    for kinds in GROUPS {
        let Some(operation) = next_in_group(site, kinds).await? else {
            continue;
        };
        tracing::info!(
            "Worker picked {} operation {} ({})",
            operation.kind,
            operation.id,
            operation.status
        );
        match dispatch(site, &operation).await {
            Ok(done) => ran.push(done),
            Err(e) => {
                tracing::error!("{} operation {} failed: {}", operation.kind, operation.id, e);
                ran.push(site.registry.get(operation.id).await?);
            }
        }
    }
    Ok(ran)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{MetaKey, Metadata, OperationRegistry};
    use crate::test_support::{table, Fixture};
    use serde_json::json;

    #[tokio::test]
    async fn test_idle_worker_does_nothing() -> Result<()> {
        let fx = Fixture::new();
        assert!(run_once(&fx.site).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_worker_runs_one_operation_per_group() -> Result<()> {
        let source = Fixture::new();
        source.db.create(table("t1", &["name"]), vec![vec![json!(1), json!("a")]]);
        let backup_op = backup::schedule(&source.site).await?;
        let ran = run_once(&source.site).await?;
        assert_eq!(ran.len(), 1);
        assert_eq!(ran[0].id, backup_op.id);
        assert_eq!(ran[0].status, OperationStatus::Finished);
        let key = ran[0].backupkey.clone().expect("backup key");

        let dest = Fixture::sharing_remote(&source);
        let dry = dryrun::schedule(&dest.site, &key).await?;
        let next_backup = backup::schedule(&dest.site).await?;
        let ran = run_once(&dest.site).await?;
        let ids: Vec<_> = ran.iter().map(|op| (op.id, op.status)).collect();
        assert_eq!(
            ids,
            vec![
                (next_backup.id, OperationStatus::Finished),
                (dry.id, OperationStatus::Finished),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_interrupted_restore_is_resumed() -> Result<()> {
        let source = Fixture::new();
        source.db.create(table("t1", &["name"]), vec![vec![json!(1), json!("a")]]);
        let op = backup::schedule(&source.site).await?;
        let key = backup::execute(&source.site, op.id).await?.backupkey.expect("backup key");

        let dest = Fixture::sharing_remote(&source);
        let restore_op = restore::schedule(&dest.site, &key).await?;
        dest.registry.transition(restore_op.id, OperationStatus::InProgress).await?;
        dest.registry
            .merge_details(restore_op.id, &Metadata::new().with(MetaKey::PointOfNoReturn, "t0"))
            .await?;

        let ran = run_once(&dest.site).await?;
        assert_eq!(ran.len(), 1);
        assert_eq!(ran[0].id, restore_op.id);
        assert_eq!(ran[0].status, OperationStatus::Finished);
        assert_eq!(dest.db.rows("t1"), vec![vec![json!(1), json!("a")]]);
        Ok(())
    }
}
