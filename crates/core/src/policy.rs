//! Per-function execution policy and the service definition document.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Execution policy resolved for one `(service, target_fn)` pair at
/// admission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionPolicy {
    /// Total attempts a job may consume (claims + sweeper recoveries).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    /// Stall timeout. `None` means the sweeper never touches the job.
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    /// Window within which a successful resolution satisfies a cached
    /// admission. `None` disables caching for the function.
    #[serde(default)]
    pub cache_ttl_seconds: Option<i64>,
}

fn default_max_attempts() -> i32 {
    1
}

impl Default for FunctionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            timeout_seconds: None,
            cache_ttl_seconds: None,
        }
    }
}

/// Per-owner, per-service definition document.
///
/// Mirrors what operators upload when registering a service: a default
/// policy plus per-function overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    #[serde(default)]
    pub defaults: FunctionPolicy,
    #[serde(default)]
    pub functions: HashMap<String, FunctionPolicy>,
}

impl ServiceDefinition {
    /// Resolve the effective policy for a function.
    pub fn policy_for(&self, target_fn: &str) -> FunctionPolicy {
        self.functions
            .get(target_fn)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }
}

/// Cluster-level knobs, scoped by owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSettings {
    #[serde(default)]
    pub predictive_retries_enabled: bool,
}
