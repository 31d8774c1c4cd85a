//! Postgres-backed job store.
//!
//! Every state transition is a single conditional UPDATE with the expected
//! status in its WHERE clause; row-level locking (`FOR UPDATE SKIP LOCKED`
//! on the claim path) makes transitions mutually exclusive across any number
//! of control-plane processes without application locks. Every predicate is
//! scoped by `owner_hash`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};

use jobrelay_core::{Job, JobId, JobStatus, MachineId, OwnerHash, ResultKind};

use super::{IdempotentInsert, JobStore, NewJob, ResultUpdate, StoreError};

const JOB_COLUMNS: &str = "owner_hash, id, service, target_fn, target_args, idempotency_key, \
     cache_key, status, result, result_kind, remaining_attempts, timeout_seconds, \
     executing_machine, last_retrieved_at, created_at, updated_at, resulted_at, \
     function_execution_ms, predicted_retryable, predicted_retryable_reason";

/// Postgres job store over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Apply the DDL in `schema.sql` (idempotent).
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in include_str!("schema.sql").split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &Arc<PgPool> {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, new: NewJob) -> Result<Job, StoreError> {
        let id = new.id.clone();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (
                owner_hash, id, service, target_fn, target_args,
                idempotency_key, cache_key, remaining_attempts, timeout_seconds
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (owner_hash, id) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(new.owner.as_str())
        .bind(new.id.as_str())
        .bind(&new.service)
        .bind(&new.target_fn)
        .bind(&new.target_args)
        .bind(&new.idempotency_key)
        .bind(&new.cache_key)
        .bind(new.remaining_attempts)
        .bind(new.timeout_seconds)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(StoreError::AlreadyExists(id)),
        }
    }

    async fn insert_idempotent(&self, new: NewJob) -> Result<IdempotentInsert, StoreError> {
        let id = new.id.clone();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (
                owner_hash, id, service, target_fn, target_args,
                idempotency_key, cache_key, remaining_attempts, timeout_seconds
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (owner_hash, id) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(new.owner.as_str())
        .bind(new.id.as_str())
        .bind(&new.service)
        .bind(&new.target_fn)
        .bind(&new.target_args)
        .bind(&new.idempotency_key)
        .bind(&new.cache_key)
        .bind(new.remaining_attempts)
        .bind(new.timeout_seconds)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job_idempotent", e))?;

        match row {
            Some(row) => Ok(IdempotentInsert::Created(job_from_row(&row)?)),
            None => Ok(IdempotentInsert::Existing(id)),
        }
    }

    async fn find_cached(
        &self,
        owner: &OwnerHash,
        service: &str,
        target_fn: &str,
        cache_key: &str,
        ttl: Duration,
    ) -> Result<Option<JobId>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id
            FROM jobs
            WHERE owner_hash = $1
              AND service = $2
              AND target_fn = $3
              AND cache_key = $4
              AND status = 'success'
              AND result_kind = 'resolution'
              AND resulted_at > NOW() - $5 * INTERVAL '1 second'
            ORDER BY resulted_at DESC
            LIMIT 1
            "#,
        )
        .bind(owner.as_str())
        .bind(service)
        .bind(target_fn)
        .bind(cache_key)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_cached", e))?;

        match row {
            Some(row) => {
                let id: String = row
                    .try_get("id")
                    .map_err(|e| map_sqlx_error("find_cached", e))?;
                Ok(Some(JobId::from_key(id)))
            }
            None => Ok(None),
        }
    }

    async fn claim(
        &self,
        owner: &OwnerHash,
        service: &str,
        machine: &MachineId,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'running',
                executing_machine = $4,
                last_retrieved_at = NOW(),
                updated_at = NOW()
            WHERE owner_hash = $1
              AND id IN (
                  SELECT id FROM jobs
                  WHERE owner_hash = $1 AND service = $2 AND status = 'pending'
                  LIMIT $3
                  FOR UPDATE SKIP LOCKED
              )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(owner.as_str())
        .bind(service)
        .bind(limit)
        .bind(machine.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        rows.iter().map(job_from_row).collect()
    }

    async fn record_result(
        &self,
        owner: &OwnerHash,
        update: ResultUpdate,
    ) -> Result<Option<Job>, StoreError> {
        // Two statements rather than one CASE expression: the requeue branch
        // consumes an attempt, the terminal branch settles the row.
        let sql = if update.requeue {
            format!(
                r#"
                UPDATE jobs
                SET status = 'pending',
                    remaining_attempts = GREATEST(remaining_attempts - 1, 0),
                    result = $3,
                    result_kind = $4,
                    function_execution_ms = $5,
                    predicted_retryable = $6,
                    predicted_retryable_reason = $7,
                    executing_machine = $8,
                    resulted_at = NOW(),
                    updated_at = NOW()
                WHERE owner_hash = $1 AND id = $2
                RETURNING {JOB_COLUMNS}
                "#
            )
        } else {
            format!(
                r#"
                UPDATE jobs
                SET status = 'success',
                    result = $3,
                    result_kind = $4,
                    function_execution_ms = $5,
                    predicted_retryable = $6,
                    predicted_retryable_reason = $7,
                    executing_machine = $8,
                    resulted_at = NOW(),
                    updated_at = NOW()
                WHERE owner_hash = $1 AND id = $2
                RETURNING {JOB_COLUMNS}
                "#
            )
        };

        let row = sqlx::query(&sql)
            .bind(owner.as_str())
            .bind(update.job_id.as_str())
            .bind(&update.result)
            .bind(update.result_kind.as_wire_str())
            .bind(update.function_execution_ms)
            .bind(update.predicted_retryable)
            .bind(&update.predicted_retryable_reason)
            .bind(update.machine.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("record_result", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn get(&self, owner: &OwnerHash, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE owner_hash = $1 AND id = $2"
        ))
        .bind(owner.as_str())
        .bind(job_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn fail_stalled(&self, _now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'failure',
                updated_at = NOW()
            WHERE status = 'running'
              AND timeout_seconds IS NOT NULL
              AND last_retrieved_at IS NOT NULL
              AND NOW() - last_retrieved_at > timeout_seconds * INTERVAL '1 second'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_stalled", e))?;

        rows.iter().map(job_from_row).collect()
    }

    async fn recover_retryable(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'pending',
                remaining_attempts = remaining_attempts - 1,
                executing_machine = NULL,
                last_retrieved_at = NULL,
                updated_at = NOW()
            WHERE status = 'failure'
              AND remaining_attempts > 0
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recover_retryable", e))?;

        rows.iter().map(job_from_row).collect()
    }

    async fn upsert_heartbeat(
        &self,
        owner: &OwnerHash,
        machine: &MachineId,
        ip: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO machine_heartbeats (owner_hash, machine_id, ip, last_seen_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (owner_hash, machine_id)
            DO UPDATE SET ip = EXCLUDED.ip, last_seen_at = EXCLUDED.last_seen_at
            "#,
        )
        .bind(owner.as_str())
        .bind(machine.as_str())
        .bind(ip)
        .bind(seen_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_heartbeat", e))?;

        Ok(())
    }

    async fn owner_is_hot(
        &self,
        owner: &OwnerHash,
        window: Duration,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM jobs
                WHERE owner_hash = $1
                  AND updated_at > NOW() - $2 * INTERVAL '1 second'
            ) AS hot
            "#,
        )
        .bind(owner.as_str())
        .bind(window.as_secs_f64())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("owner_is_hot", e))?;

        row.try_get("hot")
            .map_err(|e| map_sqlx_error("owner_is_hot", e))
    }
}

/// Map sqlx errors to [`StoreError`].
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => StoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

#[derive(Debug)]
struct JobRowOwned {
    owner_hash: String,
    id: String,
    service: String,
    target_fn: String,
    target_args: serde_json::Value,
    idempotency_key: Option<String>,
    cache_key: Option<String>,
    status: String,
    result: Option<serde_json::Value>,
    result_kind: Option<String>,
    remaining_attempts: i32,
    timeout_seconds: Option<i64>,
    executing_machine: Option<String>,
    last_retrieved_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    resulted_at: Option<DateTime<Utc>>,
    function_execution_ms: Option<i64>,
    predicted_retryable: Option<bool>,
    predicted_retryable_reason: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for JobRowOwned {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRowOwned {
            owner_hash: row.try_get("owner_hash")?,
            id: row.try_get("id")?,
            service: row.try_get("service")?,
            target_fn: row.try_get("target_fn")?,
            target_args: row.try_get("target_args")?,
            idempotency_key: row.try_get("idempotency_key")?,
            cache_key: row.try_get("cache_key")?,
            status: row.try_get("status")?,
            result: row.try_get("result")?,
            result_kind: row.try_get("result_kind")?,
            remaining_attempts: row.try_get("remaining_attempts")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            executing_machine: row.try_get("executing_machine")?,
            last_retrieved_at: row.try_get("last_retrieved_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            resulted_at: row.try_get("resulted_at")?,
            function_execution_ms: row.try_get("function_execution_ms")?,
            predicted_retryable: row.try_get("predicted_retryable")?,
            predicted_retryable_reason: row.try_get("predicted_retryable_reason")?,
        })
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let raw = JobRowOwned::from_row(row)
        .map_err(|e| StoreError::Storage(format!("failed to deserialize job row: {e}")))?;

    let status = JobStatus::from_wire_str(&raw.status)
        .map_err(|e| StoreError::Storage(format!("corrupt status column: {e}")))?;
    let result_kind = raw
        .result_kind
        .as_deref()
        .map(ResultKind::from_wire_str)
        .transpose()
        .map_err(|e| StoreError::Storage(format!("corrupt result_kind column: {e}")))?;

    Ok(Job {
        id: JobId::from_key(raw.id),
        owner: OwnerHash::new(raw.owner_hash),
        service: raw.service,
        target_fn: raw.target_fn,
        target_args: raw.target_args,
        idempotency_key: raw.idempotency_key,
        cache_key: raw.cache_key,
        status,
        result: raw.result,
        result_kind,
        remaining_attempts: raw.remaining_attempts,
        timeout_seconds: raw.timeout_seconds,
        executing_machine: raw.executing_machine.map(MachineId::new),
        last_retrieved_at: raw.last_retrieved_at,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
        resulted_at: raw.resulted_at,
        function_execution_ms: raw.function_execution_ms,
        predicted_retryable: raw.predicted_retryable,
        predicted_retryable_reason: raw.predicted_retryable_reason,
    })
}
