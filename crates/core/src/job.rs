//! The job lifecycle state machine.
//!
//! Naming note, documented once, here, at the serialization boundary: the
//! wire protocol (and the database) use the status values `pending`,
//! `running`, `success`, `failure`. Internally the last two are named
//! [`JobStatus::Terminal`] and [`JobStatus::Stalled`] because the wire names
//! are misleading — `failure` means a stalled/timed-out execution, while a
//! job whose function call threw is still `success` with a `rejection`
//! result. Serde and `as_wire_str` are the only places the mapping exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{JobId, MachineId, OwnerHash};

/// Execution status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Queued, claimable by workers.
    #[serde(rename = "pending")]
    Pending,
    /// Claimed by a machine and presumed executing.
    #[serde(rename = "running")]
    Running,
    /// A result was persisted. Includes business-level rejections.
    #[serde(rename = "success")]
    Terminal,
    /// Stuck in `running` past its timeout; the sweeper may re-queue it
    /// while attempts remain.
    #[serde(rename = "failure")]
    Stalled,
}

impl JobStatus {
    /// Wire/database representation.
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Terminal => "success",
            JobStatus::Stalled => "failure",
        }
    }

    pub fn from_wire_str(s: &str) -> Result<Self, DomainError> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Terminal),
            "failure" => Ok(JobStatus::Stalled),
            other => Err(DomainError::validation(format!(
                "unknown job status: {other}"
            ))),
        }
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// `Stalled → Pending` additionally requires attempts remaining; that
    /// check belongs to the caller holding the row.
    pub fn may_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Terminal)
                | (JobStatus::Running, JobStatus::Stalled)
                | (JobStatus::Stalled, JobStatus::Pending)
        )
    }

    /// No further transition exists once a job settles here with zero
    /// remaining attempts (`Stalled`) or at all (`Terminal`).
    pub fn is_settled(&self, remaining_attempts: i32) -> bool {
        match self {
            JobStatus::Terminal => true,
            JobStatus::Stalled => remaining_attempts <= 0,
            _ => false,
        }
    }
}

/// Kind of a persisted result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// The function returned a value.
    Resolution,
    /// The function threw. Still recorded under `success` status.
    Rejection,
}

impl ResultKind {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            ResultKind::Resolution => "resolution",
            ResultKind::Rejection => "rejection",
        }
    }

    pub fn from_wire_str(s: &str) -> Result<Self, DomainError> {
        match s {
            "resolution" => Ok(ResultKind::Resolution),
            "rejection" => Ok(ResultKind::Rejection),
            other => Err(DomainError::validation(format!(
                "unknown result kind: {other}"
            ))),
        }
    }
}

/// A job row. Created by admission, mutated by claim, result persistence and
/// the sweeper; never deleted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner: OwnerHash,
    pub service: String,
    pub target_fn: String,
    /// Opaque serialized payload; the engine never interprets it.
    pub target_args: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub cache_key: Option<String>,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub result_kind: Option<ResultKind>,
    pub remaining_attempts: i32,
    /// `None` means the sweeper never considers this job stalled.
    pub timeout_seconds: Option<i64>,
    pub executing_machine: Option<MachineId>,
    pub last_retrieved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resulted_at: Option<DateTime<Utc>>,
    pub function_execution_ms: Option<i64>,
    pub predicted_retryable: Option<bool>,
    pub predicted_retryable_reason: Option<String>,
}

impl Job {
    /// Whether the sweeper should consider this job stalled at `now`.
    pub fn is_stalled_at(&self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        let (Some(timeout), Some(retrieved)) = (self.timeout_seconds, self.last_retrieved_at)
        else {
            return false;
        };
        now - retrieved > chrono::Duration::seconds(timeout)
    }

    /// Whether the sweeper's recovery pass may re-queue this job.
    pub fn is_recoverable(&self) -> bool {
        self.status == JobStatus::Stalled && self.remaining_attempts > 0
    }
}
