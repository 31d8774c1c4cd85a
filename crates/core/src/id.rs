//! Strongly-typed identifiers used across the control plane.
//!
//! Job ids are opaque strings: a generated id is a UUIDv7 (time-ordered)
//! rendered without hyphens, but under the idempotent admission strategy the
//! caller-supplied idempotency key becomes the id verbatim. Owner hashes and
//! machine ids arrive from the outside and are never interpreted.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a job row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh, time-ordered id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    /// Use a caller-supplied key (idempotent admission) as the id.
    pub fn from_key(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Tenant/cluster boundary. Every store predicate is scoped by this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerHash(String);

/// Identity of a worker machine, as reported by the worker itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(String);

macro_rules! impl_string_newtype {
    ($t:ty) => {
        impl $t {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

impl_string_newtype!(OwnerHash);
impl_string_newtype!(MachineId);

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_hyphenless() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().contains('-'));
    }

    #[test]
    fn idempotency_key_becomes_the_id_verbatim() {
        let id = JobId::from_key("order-1234-settle");
        assert_eq!(id.as_str(), "order-1234-settle");
    }
}
