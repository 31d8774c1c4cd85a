//! Request/response DTOs.
//!
//! Field names are camelCase and status/result-kind values are the wire
//! enums (`pending`/`running`/`success`/`failure`, `resolution`/`rejection`)
//! for compatibility with existing workers. The internal/wire status naming
//! mapping is documented on [`jobrelay_core::JobStatus`].

use serde::{Deserialize, Serialize};

use jobrelay_core::{Job, JobStatus, ResultKind};

/// `POST /jobs` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub service: String,
    pub target_fn: String,
    #[serde(default)]
    pub target_args: serde_json::Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub cache_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub id: String,
}

/// `GET /jobs` query string.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimQuery {
    pub service: String,
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Long-poll budget in milliseconds.
    #[serde(default)]
    pub ttl: u64,
    pub machine_id: String,
    #[serde(default)]
    pub ip: Option<String>,
}

fn default_limit() -> i64 {
    1
}

/// One claimed job as handed to a worker.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NextJob {
    pub id: String,
    pub service: String,
    pub target_fn: String,
    pub target_args: serde_json::Value,
    pub remaining_attempts: i32,
}

impl From<&Job> for NextJob {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            service: job.service.clone(),
            target_fn: job.target_fn.clone(),
            target_args: job.target_args.clone(),
            remaining_attempts: job.remaining_attempts,
        }
    }
}

/// `POST /jobs/:job_id/result` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResultRequest {
    pub machine_id: String,
    pub result: serde_json::Value,
    pub result_type: ResultKind,
    /// Worker-reported execution time in milliseconds.
    #[serde(default)]
    pub function_execution_time: Option<i64>,
}

/// `GET /jobs/:job_id` query string.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusQuery {
    /// Long-poll budget in milliseconds; 0 reads once.
    #[serde(default)]
    pub ttl: u64,
}

/// `GET /jobs/:job_id` body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub id: String,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub result_type: Option<ResultKind>,
}

impl From<&Job> for JobStatusResponse {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            status: job.status,
            result: job.result.clone(),
            result_type: job.result_kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_accepts_minimal_body() {
        let req: CreateJobRequest =
            serde_json::from_str(r#"{"service": "imaging", "targetFn": "resize"}"#).unwrap();
        assert_eq!(req.service, "imaging");
        assert_eq!(req.target_fn, "resize");
        assert!(req.target_args.is_null());
        assert!(req.idempotency_key.is_none());
    }

    #[test]
    fn status_response_uses_wire_enum_values() {
        let json = serde_json::to_value(JobStatusResponse {
            id: "j1".to_string(),
            status: JobStatus::Stalled,
            result: None,
            result_type: Some(ResultKind::Rejection),
        })
        .unwrap();

        assert_eq!(json["status"], "failure");
        assert_eq!(json["resultType"], "rejection");
    }

    #[test]
    fn result_request_parses_worker_payload() {
        let req: SubmitResultRequest = serde_json::from_str(
            r#"{
                "machineId": "m-1",
                "result": {"name": "Err", "message": "boom"},
                "resultType": "rejection",
                "functionExecutionTime": 250
            }"#,
        )
        .unwrap();
        assert_eq!(req.result_type, ResultKind::Rejection);
        assert_eq!(req.function_execution_time, Some(250));
    }
}
