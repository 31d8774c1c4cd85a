//! Engine lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobrelay_core::{JobId, MachineId, OwnerHash, ResultKind};

/// One observability event per job state change.
///
/// Events are facts: immutable, owner-scoped, and safe to deliver more than
/// once (consumers must be idempotent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    JobCreated {
        owner: OwnerHash,
        job_id: JobId,
        service: String,
        target_fn: String,
        occurred_at: DateTime<Utc>,
    },
    JobReceived {
        owner: OwnerHash,
        job_id: JobId,
        machine: MachineId,
        occurred_at: DateTime<Utc>,
    },
    JobResulted {
        owner: OwnerHash,
        job_id: JobId,
        result_kind: ResultKind,
        occurred_at: DateTime<Utc>,
    },
    JobStalled {
        owner: OwnerHash,
        job_id: JobId,
        occurred_at: DateTime<Utc>,
    },
    JobRecovered {
        owner: OwnerHash,
        job_id: JobId,
        remaining_attempts: i32,
        occurred_at: DateTime<Utc>,
    },
    PredictorRetryableResult {
        owner: OwnerHash,
        job_id: JobId,
        retryable: bool,
        reason: String,
        occurred_at: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Stable event name used by downstream consumers.
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::JobCreated { .. } => "job_created",
            EngineEvent::JobReceived { .. } => "job_received",
            EngineEvent::JobResulted { .. } => "job_resulted",
            EngineEvent::JobStalled { .. } => "job_stalled",
            EngineEvent::JobRecovered { .. } => "job_recovered",
            EngineEvent::PredictorRetryableResult { .. } => "predictor_retryable_result",
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            EngineEvent::JobCreated { occurred_at, .. }
            | EngineEvent::JobReceived { occurred_at, .. }
            | EngineEvent::JobResulted { occurred_at, .. }
            | EngineEvent::JobStalled { occurred_at, .. }
            | EngineEvent::JobRecovered { occurred_at, .. }
            | EngineEvent::PredictorRetryableResult { occurred_at, .. } => *occurred_at,
        }
    }

    pub fn owner(&self) -> &OwnerHash {
        match self {
            EngineEvent::JobCreated { owner, .. }
            | EngineEvent::JobReceived { owner, .. }
            | EngineEvent::JobResulted { owner, .. }
            | EngineEvent::JobStalled { owner, .. }
            | EngineEvent::JobRecovered { owner, .. }
            | EngineEvent::PredictorRetryableResult { owner, .. } => owner,
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            EngineEvent::JobCreated { job_id, .. }
            | EngineEvent::JobReceived { job_id, .. }
            | EngineEvent::JobResulted { job_id, .. }
            | EngineEvent::JobStalled { job_id, .. }
            | EngineEvent::JobRecovered { job_id, .. }
            | EngineEvent::PredictorRetryableResult { job_id, .. } => job_id,
        }
    }
}
