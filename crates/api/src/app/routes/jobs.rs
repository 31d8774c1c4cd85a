//! Job lifecycle routes.

use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use jobrelay_core::{JobId, MachineId};
use jobrelay_engine::Engine;
use jobrelay_engine::admission::AdmissionRequest;
use jobrelay_engine::claim::ClaimRequest;
use jobrelay_engine::result::ResultRequest;

use crate::app::{dto, errors};
use crate::context::OwnerContext;

/// Upper bound on any long-poll budget; workers re-poll past this.
const MAX_POLL: Duration = Duration::from_secs(30);

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job).get(next_jobs))
        .route("/:job_id", get(job_status))
        .route("/:job_id/result", post(submit_result))
}

pub async fn create_job(
    Extension(engine): Extension<Engine>,
    Extension(owner): Extension<OwnerContext>,
    Json(body): Json<dto::CreateJobRequest>,
) -> axum::response::Response {
    let request = AdmissionRequest {
        service: body.service,
        target_fn: body.target_fn,
        target_args: body.target_args,
        idempotency_key: body.idempotency_key,
        cache_key: body.cache_key,
    };

    match engine.create_job(owner.owner(), request).await {
        Ok(id) => (
            StatusCode::CREATED,
            Json(dto::CreateJobResponse { id: id.to_string() }),
        )
            .into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn next_jobs(
    Extension(engine): Extension<Engine>,
    Extension(owner): Extension<OwnerContext>,
    Query(query): Query<dto::ClaimQuery>,
) -> axum::response::Response {
    let request = ClaimRequest {
        service: query.service,
        limit: query.limit,
        machine: MachineId::new(query.machine_id),
        ip: query.ip.unwrap_or_default(),
        ttl: Duration::from_millis(query.ttl).min(MAX_POLL),
    };

    match engine.next_jobs(owner.owner(), request).await {
        Ok(jobs) => {
            let body: Vec<dto::NextJob> = jobs.iter().map(dto::NextJob::from).collect();
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn submit_result(
    Extension(engine): Extension<Engine>,
    Extension(owner): Extension<OwnerContext>,
    Path(job_id): Path<String>,
    Json(body): Json<dto::SubmitResultRequest>,
) -> axum::response::Response {
    let request = ResultRequest {
        job_id: JobId::from_key(job_id),
        machine: MachineId::new(body.machine_id),
        result: body.result,
        result_kind: body.result_type,
        function_execution_ms: body.function_execution_time,
    };

    match engine.record_result(owner.owner(), request).await {
        Ok(Some(_)) => StatusCode::NO_CONTENT.into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn job_status(
    Extension(engine): Extension<Engine>,
    Extension(owner): Extension<OwnerContext>,
    Path(job_id): Path<String>,
    Query(query): Query<dto::StatusQuery>,
) -> axum::response::Response {
    let job_id = JobId::from_key(job_id);
    let ttl = Duration::from_millis(query.ttl).min(MAX_POLL);

    match engine.job_status(owner.owner(), &job_id, ttl).await {
        Ok(Some(job)) => (StatusCode::OK, Json(dto::JobStatusResponse::from(&job))).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Err(e) => errors::engine_error_to_response(e),
    }
}
