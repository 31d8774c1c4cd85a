//! Result persistence.
//!
//! Receives a worker's result, optionally classifies rejections through the
//! predictive retry pipeline, and applies the outcome as one conditional
//! update. The update is scoped by `(job_id, owner)` only — the submitting
//! machine is recorded but not checked against the claiming machine; workers
//! are trusted once authenticated to the cluster.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use jobrelay_core::{Job, JobId, MachineId, OwnerHash, ResultKind};
use jobrelay_events::{EngineEvent, EventSink};

use crate::EngineError;
use crate::classifier::RetryClassifier;
use crate::definitions::DefinitionCache;
use crate::store::{JobStore, ResultUpdate};

/// A worker's result submission, already owner-scoped by the HTTP layer.
#[derive(Debug, Clone)]
pub struct ResultRequest {
    pub job_id: JobId,
    pub machine: MachineId,
    pub result: serde_json::Value,
    pub result_kind: ResultKind,
    pub function_execution_ms: Option<i64>,
}

pub(crate) async fn record_result(
    store: &Arc<dyn JobStore>,
    definitions: &DefinitionCache,
    classifier: &RetryClassifier,
    sink: &EventSink,
    owner: &OwnerHash,
    request: ResultRequest,
) -> Result<Option<Job>, EngineError> {
    // Zero rows here means "job not found for this owner" — a silent no-op
    // for the engine, a 404 for the HTTP layer.
    let Some(current) = store.get(owner, &request.job_id).await? else {
        return Ok(None);
    };

    let mut predicted = None;
    if request.result_kind == ResultKind::Rejection {
        let settings = definitions.cluster_settings(owner).await?;
        if settings.predictive_retries_enabled {
            predicted = Some(classifier.classify(&request.result).await);
        }
    }

    let requeue = predicted
        .as_ref()
        .is_some_and(|v| v.retryable && current.remaining_attempts > 0);

    let update = ResultUpdate {
        job_id: request.job_id.clone(),
        machine: request.machine.clone(),
        result: request.result,
        result_kind: request.result_kind,
        function_execution_ms: request.function_execution_ms,
        predicted_retryable: predicted.as_ref().map(|v| v.retryable),
        predicted_retryable_reason: predicted.as_ref().map(|v| v.reason.clone()),
        requeue,
    };

    let Some(updated) = store.record_result(owner, update).await? else {
        // The row vanished between the read and the update; treat exactly
        // like the initial miss.
        return Ok(None);
    };

    debug!(
        owner = %owner,
        job_id = %updated.id,
        status = updated.status.as_wire_str(),
        requeued = requeue,
        "result persisted"
    );

    sink.emit(EngineEvent::JobResulted {
        owner: owner.clone(),
        job_id: updated.id.clone(),
        result_kind: request.result_kind,
        occurred_at: Utc::now(),
    })
    .await;

    if let Some(verdict) = predicted {
        sink.emit(EngineEvent::PredictorRetryableResult {
            owner: owner.clone(),
            job_id: updated.id.clone(),
            retryable: verdict.retryable,
            reason: verdict.reason,
            occurred_at: Utc::now(),
        })
        .await;
    }

    Ok(Some(updated))
}
