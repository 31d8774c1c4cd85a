//! Job admission.
//!
//! Three strategies decide whether a creation request inserts a row or
//! returns an existing id:
//!
//! - **idempotent** (an idempotency key is supplied): the key becomes the
//!   id; a conflicting insert returns the existing id. At-most-one logical
//!   job per key, regardless of caller retry storms.
//! - **cached** (a cache key is supplied and the function's policy carries a
//!   cache TTL): the freshest successful resolution inside the TTL window is
//!   returned instead of inserting. Rejections and expired rows never hit.
//! - **default**: always insert with a generated id.
//!
//! Duplicate idempotency keys and cache hits are intended outcomes, never
//! errors.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use jobrelay_core::{FunctionPolicy, JobId, OwnerHash};
use jobrelay_events::{EngineEvent, EventSink};

use crate::EngineError;
use crate::definitions::DefinitionCache;
use crate::store::{IdempotentInsert, JobStore, NewJob};

/// A creation request, already owner-scoped by the HTTP layer.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub service: String,
    pub target_fn: String,
    pub target_args: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub cache_key: Option<String>,
}

pub(crate) async fn create_job(
    store: &Arc<dyn JobStore>,
    definitions: &DefinitionCache,
    sink: &EventSink,
    owner: &OwnerHash,
    request: AdmissionRequest,
) -> Result<JobId, EngineError> {
    if request.service.is_empty() {
        return Err(EngineError::Validation("service must not be empty".into()));
    }
    if request.target_fn.is_empty() {
        return Err(EngineError::Validation(
            "target_fn must not be empty".into(),
        ));
    }

    let policy = definitions
        .function_policy(owner, &request.service, &request.target_fn)
        .await?;

    // An idempotency key takes precedence over a cache key when both are
    // supplied: the caller asked for at-most-once, not for a cached read.
    if let Some(key) = request.idempotency_key.clone() {
        return admit_idempotent(store, sink, owner, request, &policy, key).await;
    }
    if let Some(key) = request.cache_key.clone() {
        return admit_cached(store, sink, owner, request, &policy, key).await;
    }
    admit_default(store, sink, owner, request, &policy).await
}

async fn admit_default(
    store: &Arc<dyn JobStore>,
    sink: &EventSink,
    owner: &OwnerHash,
    request: AdmissionRequest,
    policy: &FunctionPolicy,
) -> Result<JobId, EngineError> {
    let job = store
        .insert(new_row(JobId::generate(), owner, &request, policy))
        .await?;

    emit_created(sink, owner, &job.id, &request).await;
    Ok(job.id)
}

async fn admit_idempotent(
    store: &Arc<dyn JobStore>,
    sink: &EventSink,
    owner: &OwnerHash,
    request: AdmissionRequest,
    policy: &FunctionPolicy,
    key: String,
) -> Result<JobId, EngineError> {
    let outcome = store
        .insert_idempotent(new_row(JobId::from_key(key), owner, &request, policy))
        .await?;

    match outcome {
        IdempotentInsert::Created(job) => {
            emit_created(sink, owner, &job.id, &request).await;
            Ok(job.id)
        }
        IdempotentInsert::Existing(id) => {
            debug!(owner = %owner, job_id = %id, "idempotent admission matched existing job");
            Ok(id)
        }
    }
}

async fn admit_cached(
    store: &Arc<dyn JobStore>,
    sink: &EventSink,
    owner: &OwnerHash,
    request: AdmissionRequest,
    policy: &FunctionPolicy,
    cache_key: String,
) -> Result<JobId, EngineError> {
    // No TTL in the policy means caching is off for this function; the row
    // still carries the key so a later policy change can start matching.
    if let Some(ttl_seconds) = policy.cache_ttl_seconds {
        let ttl = Duration::from_secs(ttl_seconds.max(0) as u64);
        if let Some(id) = store
            .find_cached(owner, &request.service, &request.target_fn, &cache_key, ttl)
            .await?
        {
            debug!(owner = %owner, job_id = %id, "cached admission hit");
            return Ok(id);
        }
    }

    // Lookup and insert are deliberately two statements; concurrent
    // identical requests may each insert. Accepted under at-least-once.
    let job = store
        .insert(new_row(JobId::generate(), owner, &request, policy))
        .await?;

    emit_created(sink, owner, &job.id, &request).await;
    Ok(job.id)
}

fn new_row(
    id: JobId,
    owner: &OwnerHash,
    request: &AdmissionRequest,
    policy: &FunctionPolicy,
) -> NewJob {
    NewJob {
        id,
        owner: owner.clone(),
        service: request.service.clone(),
        target_fn: request.target_fn.clone(),
        target_args: request.target_args.clone(),
        idempotency_key: request.idempotency_key.clone(),
        cache_key: request.cache_key.clone(),
        remaining_attempts: policy.max_attempts.max(1),
        timeout_seconds: policy.timeout_seconds,
    }
}

async fn emit_created(
    sink: &EventSink,
    owner: &OwnerHash,
    job_id: &JobId,
    request: &AdmissionRequest,
) {
    sink.emit(EngineEvent::JobCreated {
        owner: owner.clone(),
        job_id: job_id.clone(),
        service: request.service.clone(),
        target_fn: request.target_fn.clone(),
        occurred_at: Utc::now(),
    })
    .await;
}
