//! Execution record store and log sink on Postgres.
//!
//! Serializability of the RUNNING upsert vs the terminal write comes from
//! single-row guarded statements: the terminal UPDATE only matches
//! non-terminal rows, and the upsert's promotion UPDATE carries the same
//! guard, so a finalized record can never be dragged back to RUNNING.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};

use bf_ids::ExecutionId;
use bf_schemas::{
    ErrorKind, ExecutionKind, ExecutionRecord, ExecutionStatus, Finalization, FinalizeOutcome,
    LogLine, LogSink, NewRunningRecord, RecordStore, UpsertOutcome,
};

// ---------------------------------------------------------------------------
// PgRecordStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_status(&self, id: ExecutionId) -> Result<Option<ExecutionStatus>> {
        let row: Option<(String,)> =
            sqlx::query_as("select status from executions where execution_id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .context("fetch_status failed")?;
        row.map(|(s,)| ExecutionStatus::parse(&s)).transpose()
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert_running(&self, rec: &NewRunningRecord) -> Result<UpsertOutcome> {
        // Fast path: fresh insert.
        let inserted: Option<(uuid::Uuid,)> = sqlx::query_as(
            r#"
            insert into executions (
              execution_id, kind, target_id, tenant_id, user_id, status, started_at_utc
            ) values (
              $1, $2, $3, $4, $5, 'RUNNING', $6
            )
            on conflict (execution_id) do nothing
            returning execution_id
            "#,
        )
        .bind(rec.id.as_uuid())
        .bind(rec.kind.as_str())
        .bind(&rec.target_id)
        .bind(&rec.tenant_id)
        .bind(&rec.user_id)
        .bind(rec.started_at)
        .fetch_optional(&self.pool)
        .await
        .context("upsert_running insert failed")?;

        if inserted.is_some() {
            return Ok(UpsertOutcome::Inserted);
        }

        // Duplicate delivery: promote only non-terminal rows, keeping the
        // original started_at.
        let promoted: Option<(uuid::Uuid,)> = sqlx::query_as(
            r#"
            update executions
               set status = 'RUNNING',
                   started_at_utc = coalesce(started_at_utc, $2)
             where execution_id = $1
               and status in ('PENDING','RUNNING')
            returning execution_id
            "#,
        )
        .bind(rec.id.as_uuid())
        .bind(rec.started_at)
        .fetch_optional(&self.pool)
        .await
        .context("upsert_running promote failed")?;

        if promoted.is_some() {
            return Ok(UpsertOutcome::AlreadyRunning);
        }

        let status = self
            .fetch_status(rec.id)
            .await?
            .ok_or_else(|| anyhow!("upsert_running: record vanished for {}", rec.id))?;
        Ok(UpsertOutcome::AlreadyTerminal(status))
    }

    async fn finalize(&self, id: ExecutionId, fin: &Finalization) -> Result<FinalizeOutcome> {
        let updated: Option<(uuid::Uuid,)> = sqlx::query_as(
            r#"
            update executions
               set status          = $2,
                   finished_at_utc = $3,
                   result          = $4,
                   error_kind      = $5,
                   error_message   = $6,
                   logs_ref        = $7,
                   resource_usage  = $8
             where execution_id = $1
               and status in ('PENDING','RUNNING')
            returning execution_id
            "#,
        )
        .bind(id.as_uuid())
        .bind(fin.status.as_str())
        .bind(fin.finished_at)
        .bind(&fin.result)
        .bind(fin.error_kind.map(|k| k.as_str()))
        .bind(&fin.error_message)
        .bind(&fin.logs_ref)
        .bind(
            fin.resource_usage
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .context("resource_usage serialization failed")?,
        )
        .fetch_optional(&self.pool)
        .await
        .context("finalize update failed")?;

        if updated.is_some() {
            return Ok(FinalizeOutcome::Finalized);
        }

        let status = self
            .fetch_status(id)
            .await?
            .ok_or_else(|| anyhow!("finalize: unknown execution {id}"))?;
        Ok(FinalizeOutcome::AlreadyTerminal(status))
    }

    async fn count_active(&self, tenant_id: &str) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as(
            r#"
            select count(*)::bigint
            from executions
            where tenant_id = $1
              and status in ('PENDING','RUNNING')
            "#,
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .context("count_active failed")?;
        Ok(n)
    }

    async fn get(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>> {
        let row = sqlx::query(
            r#"
            select
              execution_id, kind, target_id, tenant_id, user_id, status,
              started_at_utc, finished_at_utc, result, error_kind,
              error_message, logs_ref, resource_usage
            from executions
            where execution_id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .context("get execution failed")?;

        let Some(row) = row else { return Ok(None) };

        let error_kind = row
            .try_get::<Option<String>, _>("error_kind")?
            .map(|s| ErrorKind::parse(&s))
            .transpose()?;
        let resource_usage = row
            .try_get::<Option<serde_json::Value>, _>("resource_usage")?
            .map(serde_json::from_value)
            .transpose()
            .context("resource_usage deserialization failed")?;

        Ok(Some(ExecutionRecord {
            id: ExecutionId::from_uuid(row.try_get("execution_id")?),
            kind: ExecutionKind::parse(&row.try_get::<String, _>("kind")?)?,
            target_id: row.try_get("target_id")?,
            tenant_id: row.try_get("tenant_id")?,
            user_id: row.try_get("user_id")?,
            status: ExecutionStatus::parse(&row.try_get::<String, _>("status")?)?,
            started_at: row.try_get("started_at_utc")?,
            finished_at: row.try_get("finished_at_utc")?,
            result: row.try_get("result")?,
            error_kind,
            error_message: row.try_get("error_message")?,
            logs_ref: row.try_get("logs_ref")?,
            resource_usage,
        }))
    }
}

// ---------------------------------------------------------------------------
// PgLogSink
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgLogSink {
    pool: PgPool,
}

impl PgLogSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogSink for PgLogSink {
    async fn put(&self, id: ExecutionId, lines: &[LogLine]) -> Result<String> {
        let (log_id,): (i64,) = sqlx::query_as(
            r#"
            insert into execution_logs (execution_id, lines)
            values ($1, $2)
            returning log_id
            "#,
        )
        .bind(id.as_uuid())
        .bind(serde_json::to_value(lines).context("log lines serialization failed")?)
        .fetch_one(&self.pool)
        .await
        .context("log sink put failed")?;

        Ok(format!("pg:execution_logs:{log_id}"))
    }
}
