use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobrelay_core::OwnerHash;

/// Access-token claims model (transport-agnostic).
///
/// The minimal set of claims the control plane expects once a token has been
/// decoded/verified by whatever transport/security layer is in use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Access-key identifier the token was minted for.
    pub sub: String,

    /// Resolved owner hash — the tenant scope for every engine call.
    pub owner: OwnerHash,

    /// Issued-at timestamp.
    pub issued_at: DateTime<Utc>,

    /// Expiration timestamp.
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenValidationError {
    #[error("token has expired")]
    Expired,

    #[error("token not yet valid (issued_at is in the future)")]
    NotYetValid,

    #[error("invalid token time window (expires_at <= issued_at)")]
    InvalidTimeWindow,

    #[error("token could not be decoded")]
    Malformed,
}

/// Deterministically validate token claims.
///
/// Note: this validates the *claims* only. Signature verification / decoding
/// is the validator's job.
pub fn validate_claims(
    claims: &AccessClaims,
    now: DateTime<Utc>,
) -> Result<(), TokenValidationError> {
    if claims.expires_at <= claims.issued_at {
        return Err(TokenValidationError::InvalidTimeWindow);
    }
    if now < claims.issued_at {
        return Err(TokenValidationError::NotYetValid);
    }
    if now >= claims.expires_at {
        return Err(TokenValidationError::Expired);
    }
    Ok(())
}
