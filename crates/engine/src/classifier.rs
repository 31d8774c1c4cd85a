//! Predictive retry classification.
//!
//! When a worker reports a rejection and the owner has predictive retries
//! enabled, the engine asks whether the error is worth retrying: a local
//! verdict cache keyed by `(error_name, error_message)` is consulted first,
//! then an external prediction service. Any failure along the way — an
//! unparseable payload, a predictor outage, a cache write error — degrades
//! to "not retryable" with a recorded reason and never fails the request.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Structured error extracted from a rejection result payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredError {
    pub name: String,
    pub message: String,
}

impl StructuredError {
    /// Pull `{name, message}` out of a rejection result. The payload is
    /// worker-controlled, so anything else is a parse miss, not an error.
    pub fn from_result(result: &serde_json::Value) -> Option<Self> {
        let name = result.get("name")?.as_str()?.to_string();
        let message = result
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        Some(Self { name, message })
    }
}

/// The classifier's judgment on one error shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryVerdict {
    pub retryable: bool,
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PredictorError {
    #[error("prediction service unavailable: {0}")]
    Unavailable(String),

    #[error("prediction service returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("no prediction service configured")]
    NotConfigured,
}

/// External judgment on whether an error is retryable.
#[async_trait]
pub trait RetryPredictor: Send + Sync {
    async fn predict(&self, error: &StructuredError) -> Result<RetryVerdict, PredictorError>;
}

/// Local cache of predictor verdicts. Writes are best-effort.
#[async_trait]
pub trait VerdictCache: Send + Sync {
    async fn get(&self, error: &StructuredError) -> Option<RetryVerdict>;

    async fn put(&self, error: &StructuredError, verdict: &RetryVerdict) -> Result<(), String>;
}

/// In-memory verdict cache.
#[derive(Debug, Default)]
pub struct InMemoryVerdictCache {
    verdicts: RwLock<HashMap<(String, String), RetryVerdict>>,
}

impl InMemoryVerdictCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VerdictCache for InMemoryVerdictCache {
    async fn get(&self, error: &StructuredError) -> Option<RetryVerdict> {
        let verdicts = self.verdicts.read().ok()?;
        verdicts
            .get(&(error.name.clone(), error.message.clone()))
            .cloned()
    }

    async fn put(&self, error: &StructuredError, verdict: &RetryVerdict) -> Result<(), String> {
        let mut verdicts = self
            .verdicts
            .write()
            .map_err(|_| "verdict cache poisoned".to_string())?;
        verdicts.insert(
            (error.name.clone(), error.message.clone()),
            verdict.clone(),
        );
        Ok(())
    }
}

/// Predictor stand-in for deployments without a prediction service.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredPredictor;

#[async_trait]
impl RetryPredictor for UnconfiguredPredictor {
    async fn predict(&self, _error: &StructuredError) -> Result<RetryVerdict, PredictorError> {
        Err(PredictorError::NotConfigured)
    }
}

/// HTTP predictor client.
#[derive(Debug, Clone)]
pub struct HttpRetryPredictor {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    error_name: &'a str,
    error_message: &'a str,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    retryable: bool,
    #[serde(default)]
    reason: Option<String>,
}

impl HttpRetryPredictor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl RetryPredictor for HttpRetryPredictor {
    async fn predict(&self, error: &StructuredError) -> Result<RetryVerdict, PredictorError> {
        let response = self
            .client
            .post(&self.url)
            .json(&PredictRequest {
                error_name: &error.name,
                error_message: &error.message,
            })
            .send()
            .await
            .map_err(|e| PredictorError::Unavailable(e.to_string()))?;

        let response = response
            .error_for_status()
            .map_err(|e| PredictorError::Unavailable(e.to_string()))?;

        let body: PredictResponse = response
            .json()
            .await
            .map_err(|e| PredictorError::InvalidResponse(e.to_string()))?;

        Ok(RetryVerdict {
            retryable: body.retryable,
            reason: body
                .reason
                .unwrap_or_else(|| "predicted by service".to_string()),
        })
    }
}

/// Cache-then-predict classifier. Never errors: every failure mode maps to a
/// "not retryable" verdict carrying the reason.
#[derive(Clone)]
pub struct RetryClassifier {
    cache: Arc<dyn VerdictCache>,
    predictor: Arc<dyn RetryPredictor>,
}

impl RetryClassifier {
    pub fn new(cache: Arc<dyn VerdictCache>, predictor: Arc<dyn RetryPredictor>) -> Self {
        Self { cache, predictor }
    }

    pub async fn classify(&self, result: &serde_json::Value) -> RetryVerdict {
        let Some(error) = StructuredError::from_result(result) else {
            return RetryVerdict {
                retryable: false,
                reason: "rejection payload is not a structured error".to_string(),
            };
        };

        if let Some(verdict) = self.cache.get(&error).await {
            debug!(error_name = %error.name, "verdict cache hit");
            return verdict;
        }

        let verdict = match self.predictor.predict(&error).await {
            Ok(verdict) => verdict,
            Err(err) => RetryVerdict {
                retryable: false,
                reason: err.to_string(),
            },
        };

        if let Err(err) = self.cache.put(&error, &verdict).await {
            warn!(error_name = %error.name, error = %err, "failed to cache retry verdict");
        }

        verdict
    }
}

impl core::fmt::Debug for RetryClassifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetryClassifier").finish_non_exhaustive()
    }
}
