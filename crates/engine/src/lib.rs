//! `jobrelay-engine` — the job lifecycle engine.
//!
//! Stateless request handlers over a durable job store: admission (plain /
//! idempotent / cached), atomic dequeue under contention, result persistence
//! with optional predictive-retry classification, and the self-healing
//! sweeper. Correctness holds under arbitrary interleaving across any number
//! of control-plane processes: every state transition is a single
//! conditional statement against the store, and the only explicit lock in
//! the system is the sweeper's distributed mutex.

pub mod admission;
pub mod claim;
pub mod classifier;
pub mod definitions;
pub mod mutex;
pub mod result;
pub mod store;
pub mod sweeper;

use std::sync::Arc;
use std::time::Duration;

use jobrelay_events::EventSink;

use crate::admission::AdmissionRequest;
use crate::claim::ClaimRequest;
use crate::classifier::RetryClassifier;
use crate::definitions::DefinitionCache;
use crate::result::ResultRequest;
use crate::store::{JobStore, StoreError};

use jobrelay_core::{Job, JobId, OwnerHash};

/// Engine-level error surfaced to the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Façade bundling the engine's components behind one handle.
///
/// Cheap to clone; every control-plane process holds one and serves requests
/// concurrently through it.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn JobStore>,
    definitions: DefinitionCache,
    classifier: RetryClassifier,
    sink: EventSink,
}

impl Engine {
    pub fn new(
        store: Arc<dyn JobStore>,
        definitions: DefinitionCache,
        classifier: RetryClassifier,
        sink: EventSink,
    ) -> Self {
        Self {
            store,
            definitions,
            classifier,
            sink,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    /// Admit a job (`POST /jobs`).
    pub async fn create_job(
        &self,
        owner: &OwnerHash,
        request: AdmissionRequest,
    ) -> Result<JobId, EngineError> {
        admission::create_job(&self.store, &self.definitions, &self.sink, owner, request).await
    }

    /// Long-poll claim (`GET /jobs`).
    pub async fn next_jobs(
        &self,
        owner: &OwnerHash,
        request: ClaimRequest,
    ) -> Result<Vec<Job>, EngineError> {
        claim::next_jobs(&self.store, &self.sink, owner, request).await
    }

    /// Persist a worker's result (`POST /jobs/:job_id/result`).
    ///
    /// Returns `None` when no job matches `(job_id, owner)`.
    pub async fn record_result(
        &self,
        owner: &OwnerHash,
        request: ResultRequest,
    ) -> Result<Option<Job>, EngineError> {
        result::record_result(
            &self.store,
            &self.definitions,
            &self.classifier,
            &self.sink,
            owner,
            request,
        )
        .await
    }

    /// Bounded long-poll status read (`GET /jobs/:job_id`).
    ///
    /// Re-reads every 500ms until the job settles or `ttl` elapses, then
    /// returns whatever was last observed. `None` means no job matches
    /// `(job_id, owner)`.
    pub async fn job_status(
        &self,
        owner: &OwnerHash,
        job_id: &JobId,
        ttl: Duration,
    ) -> Result<Option<Job>, EngineError> {
        const POLL_TICK: Duration = Duration::from_millis(500);

        let deadline = tokio::time::Instant::now() + ttl;
        loop {
            let Some(job) = self.store.get(owner, job_id).await? else {
                return Ok(None);
            };

            if job.status.is_settled(job.remaining_attempts) {
                return Ok(Some(job));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Some(job));
            }
            tokio::time::sleep(POLL_TICK.min(deadline - now)).await;
        }
    }
}
