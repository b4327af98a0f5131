// sitevault/src/operation/postgres.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::OnceCell;

use super::{
    LogEntry, LogLevel, Metadata, Operation, OperationId, OperationKind, OperationRegistry,
    OperationStatus,
};
use crate::errors::{Result, VaultError};

const CREATE_TABLES: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS vault_operations (
        id BIGSERIAL PRIMARY KEY,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        backupkey TEXT,
        details JSONB NOT NULL DEFAULT '{}'::jsonb,
        timecreated TIMESTAMPTZ NOT NULL,
        timestarted TIMESTAMPTZ,
        timefinished TIMESTAMPTZ,
        timefailed TIMESTAMPTZ,
        timemodified TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS vault_operation_logs (
        id BIGSERIAL PRIMARY KEY,
        operationid BIGINT NOT NULL REFERENCES vault_operations(id),
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        timecreated TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS vault_operation_logs_operationid_idx
        ON vault_operation_logs (operationid, id)",
];

const SELECT_OPERATION: &str = "SELECT id, kind, status, backupkey, details, timecreated,
        timestarted, timefinished, timefailed, timemodified
     FROM vault_operations";

/// Operation registry backed by two bookkeeping tables in the site database.
pub struct PgOperationRegistry {
    pool: PgPool,
    ready: OnceCell<()>,
}

impl PgOperationRegistry {
    pub fn new(pool: PgPool) -> Self {
        PgOperationRegistry {
            pool,
            ready: OnceCell::new(),
        }
    }

    async fn ensure_tables(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| async {
                for statement in CREATE_TABLES {
                    sqlx::query(statement).execute(&self.pool).await?;
                }
                Ok::<(), VaultError>(())
            })
            .await?;
        Ok(())
    }
}

fn operation_from_row(row: &PgRow) -> Result<Operation> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let details: serde_json::Value = row.try_get("details")?;
    Ok(Operation {
        id: row.try_get("id")?,
        kind: OperationKind::parse(&kind)
            .ok_or_else(|| VaultError::InvalidState(format!("Unknown operation kind '{}'", kind)))?,
        status: OperationStatus::parse(&status).ok_or_else(|| {
            VaultError::InvalidState(format!("Unknown operation status '{}'", status))
        })?,
        backupkey: row.try_get("backupkey")?,
        details: serde_json::from_value(details)?,
        timecreated: row.try_get("timecreated")?,
        timestarted: row.try_get("timestarted")?,
        timefinished: row.try_get("timefinished")?,
        timefailed: row.try_get("timefailed")?,
        timemodified: row.try_get("timemodified")?,
    })
}

#[async_trait]
impl OperationRegistry for PgOperationRegistry {
    async fn schedule(
        &self,
        kind: OperationKind,
        backupkey: Option<&str>,
        details: Metadata,
    ) -> Result<Operation> {
        self.ensure_tables().await?;
        let conflicting: Vec<&str> = kind.conflicting().iter().map(|k| k.as_str()).collect();
        let active: Vec<&str> = OperationStatus::ACTIVE.iter().map(|s| s.as_str()).collect();

        let mut tx = self.pool.begin().await?;
        let existing: Option<(i64, String)> = sqlx::query_as(
            "SELECT id, kind FROM vault_operations
             WHERE kind = ANY($1) AND status = ANY($2)
             ORDER BY id LIMIT 1",
        )
        .bind(&conflicting)
        .bind(&active)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some((id, other)) = existing {
            return Err(VaultError::Conflict(format!(
                "Cannot schedule {}: {} operation {} is already scheduled or in progress",
                kind, other, id
            )));
        }

        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO vault_operations (kind, status, backupkey, details, timecreated, timemodified)
             VALUES ($1, $2, $3, $4, $5, $5)
             RETURNING id, kind, status, backupkey, details, timecreated,
                       timestarted, timefinished, timefailed, timemodified",
        )
        .bind(kind.as_str())
        .bind(OperationStatus::Scheduled.as_str())
        .bind(backupkey)
        .bind(serde_json::to_value(&details)?)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        operation_from_row(&row)
    }

    async fn get(&self, id: OperationId) -> Result<Operation> {
        self.ensure_tables().await?;
        let row = sqlx::query(&format!("{} WHERE id = $1", SELECT_OPERATION))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("Operation {}", id)))?;
        operation_from_row(&row)
    }

    async fn find(&self, kinds: &[OperationKind], statuses: &[OperationStatus]) -> Result<Vec<Operation>> {
        self.ensure_tables().await?;
        let kinds: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query(&format!(
            "{} WHERE kind = ANY($1) AND (cardinality($2::text[]) = 0 OR status = ANY($2))
             ORDER BY timecreated DESC, id DESC",
            SELECT_OPERATION
        ))
        .bind(&kinds)
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(operation_from_row).collect()
    }

    async fn transition(&self, id: OperationId, status: OperationStatus) -> Result<Operation> {
        let mut operation = self.get(id).await?;
        operation.apply_transition(status, Utc::now())?;
        // The status guard keeps a concurrent writer from overwriting a terminal state.
        let result = sqlx::query(
            "UPDATE vault_operations
             SET status = $2, timestarted = $3, timefinished = $4, timefailed = $5, timemodified = $6
             WHERE id = $1 AND status NOT IN ('finished', 'failed', 'failed_to_start')",
        )
        .bind(id)
        .bind(operation.status.as_str())
        .bind(operation.timestarted)
        .bind(operation.timefinished)
        .bind(operation.timefailed)
        .bind(operation.timemodified)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(VaultError::InvalidState(format!(
                "Operation {} reached a terminal status concurrently",
                id
            )));
        }
        Ok(operation)
    }

    async fn set_backupkey(&self, id: OperationId, backupkey: &str) -> Result<()> {
        self.ensure_tables().await?;
        sqlx::query("UPDATE vault_operations SET backupkey = $2, timemodified = $3 WHERE id = $1")
            .bind(id)
            .bind(backupkey)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn merge_details(&self, id: OperationId, details: &Metadata) -> Result<()> {
        self.ensure_tables().await?;
        sqlx::query(
            "UPDATE vault_operations SET details = details || $2, timemodified = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(serde_json::to_value(details)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_log(&self, id: OperationId, level: LogLevel, message: &str) -> Result<LogEntry> {
        self.ensure_tables().await?;
        let timecreated = Utc::now();
        sqlx::query(
            "INSERT INTO vault_operation_logs (operationid, level, message, timecreated)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(level.as_str())
        .bind(message)
        .bind(timecreated)
        .execute(&self.pool)
        .await?;
        Ok(LogEntry {
            timecreated,
            level,
            message: message.to_string(),
        })
    }

    async fn logs(&self, id: OperationId) -> Result<Vec<LogEntry>> {
        self.ensure_tables().await?;
        let rows: Vec<(String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT level, message, timecreated FROM vault_operation_logs
             WHERE operationid = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(level, message, timecreated)| LogEntry {
                timecreated,
                level: LogLevel::parse(&level),
                message,
            })
            .collect())
    }
}
