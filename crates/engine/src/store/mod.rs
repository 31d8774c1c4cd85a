//! Job storage.
//!
//! The store is where the system's concurrency design lives: every state
//! transition is one conditional, atomic statement (`WHERE status =
//! <expected>` plus owner scoping), so correctness needs no application
//! locks. An update matching zero rows is "not found"/"lost the race", never
//! an error.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobrelay_core::{Job, JobId, MachineId, OwnerHash, ResultKind};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Storage error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// A row with the same identity already exists (non-idempotent insert).
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// The backend failed; the caller should retry.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Row to insert at admission time.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub owner: OwnerHash,
    pub service: String,
    pub target_fn: String,
    pub target_args: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub cache_key: Option<String>,
    pub remaining_attempts: i32,
    pub timeout_seconds: Option<i64>,
}

/// Outcome of an idempotent insert.
#[derive(Debug, Clone)]
pub enum IdempotentInsert {
    /// A fresh row was created.
    Created(Job),
    /// A row for this `(owner, idempotency_key)` already existed.
    Existing(JobId),
}

/// Conditional update applied by result persistence.
#[derive(Debug, Clone)]
pub struct ResultUpdate {
    pub job_id: JobId,
    pub machine: MachineId,
    pub result: serde_json::Value,
    pub result_kind: ResultKind,
    pub function_execution_ms: Option<i64>,
    pub predicted_retryable: Option<bool>,
    pub predicted_retryable_reason: Option<String>,
    /// `true`: back to pending with one attempt consumed (predictive
    /// retry). `false`: terminal.
    pub requeue: bool,
}

/// Durable job table plus machine heartbeats.
///
/// Implementations must make [`claim`](JobStore::claim) mutually exclusive
/// across arbitrary concurrent callers — two callers never receive the same
/// row.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a fresh row. Fails with [`StoreError::AlreadyExists`] on id
    /// collision (callers generate unique ids).
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Insert keyed by the idempotency key; a conflict is the intended
    /// outcome, not a failure.
    async fn insert_idempotent(&self, job: NewJob) -> Result<IdempotentInsert, StoreError>;

    /// Freshest row matching `(owner, service, target_fn, cache_key)` that
    /// resolved successfully within `ttl`. Rejections never match.
    async fn find_cached(
        &self,
        owner: &OwnerHash,
        service: &str,
        target_fn: &str,
        cache_key: &str,
        ttl: Duration,
    ) -> Result<Option<JobId>, StoreError>;

    /// Atomically move up to `limit` pending rows for `(owner, service)` to
    /// running, stamping the claiming machine, and return them.
    async fn claim(
        &self,
        owner: &OwnerHash,
        service: &str,
        machine: &MachineId,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError>;

    /// Apply a result. Scoped by `(job_id, owner)` only; returns `None`
    /// when no row matched.
    async fn record_result(
        &self,
        owner: &OwnerHash,
        update: ResultUpdate,
    ) -> Result<Option<Job>, StoreError>;

    async fn get(&self, owner: &OwnerHash, job_id: &JobId) -> Result<Option<Job>, StoreError>;

    /// Sweeper pass 1: running rows past their timeout become stalled.
    /// Returns the affected rows. Spans all owners.
    async fn fail_stalled(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Sweeper pass 2: stalled rows with attempts remaining go back to
    /// pending, consuming one attempt. Returns the affected rows.
    async fn recover_retryable(&self) -> Result<Vec<Job>, StoreError>;

    /// Best-effort machine heartbeat (last seen, IP).
    async fn upsert_heartbeat(
        &self,
        owner: &OwnerHash,
        machine: &MachineId,
        ip: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Whether the owner had any job activity within `window` (drives the
    /// long-poll backoff: hot owners poll at 100ms, cold at 1s).
    async fn owner_is_hot(&self, owner: &OwnerHash, window: Duration)
    -> Result<bool, StoreError>;
}
