//! Token decoding and signature verification.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};

use crate::claims::{AccessClaims, TokenValidationError, validate_claims};

/// Validates a presented bearer token and yields its claims.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str, now: DateTime<Utc>)
    -> Result<AccessClaims, TokenValidationError>;
}

/// HS256 JWT validator.
///
/// The time-window check is ours ([`validate_claims`]); jsonwebtoken's own
/// `exp`/`nbf` handling is disabled so the behavior stays deterministic and
/// testable with an injected `now`.
pub struct Hs256TokenValidator {
    key: DecodingKey,
}

impl Hs256TokenValidator {
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            key: DecodingKey::from_secret(&secret),
        }
    }
}

impl TokenValidator for Hs256TokenValidator {
    fn validate(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessClaims, TokenValidationError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let data = jsonwebtoken::decode::<AccessClaims>(token, &self.key, &validation)
            .map_err(|_| TokenValidationError::Malformed)?;

        validate_claims(&data.claims, now)?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use jobrelay_core::OwnerHash;
    use jsonwebtoken::{EncodingKey, Header};

    use super::*;

    fn mint(secret: &str, claims: &AccessClaims) -> String {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("failed to encode jwt")
    }

    #[test]
    fn round_trip_yields_owner() {
        let now = Utc::now();
        let claims = AccessClaims {
            sub: "key-1".to_string(),
            owner: OwnerHash::new("owner-a"),
            issued_at: now - Duration::minutes(1),
            expires_at: now + Duration::minutes(10),
        };
        let token = mint("s3cret", &claims);

        let validator = Hs256TokenValidator::new(b"s3cret".to_vec());
        let decoded = validator.validate(&token, now).unwrap();
        assert_eq!(decoded.owner, OwnerHash::new("owner-a"));
    }

    #[test]
    fn wrong_secret_is_malformed() {
        let now = Utc::now();
        let claims = AccessClaims {
            sub: "key-1".to_string(),
            owner: OwnerHash::new("owner-a"),
            issued_at: now - Duration::minutes(1),
            expires_at: now + Duration::minutes(10),
        };
        let token = mint("s3cret", &claims);

        let validator = Hs256TokenValidator::new(b"other".to_vec());
        assert_eq!(
            validator.validate(&token, now),
            Err(TokenValidationError::Malformed)
        );
    }

    #[test]
    fn expired_claims_are_rejected_after_decode() {
        let now = Utc::now();
        let claims = AccessClaims {
            sub: "key-1".to_string(),
            owner: OwnerHash::new("owner-a"),
            issued_at: now - Duration::minutes(20),
            expires_at: now - Duration::minutes(10),
        };
        let token = mint("s3cret", &claims);

        let validator = Hs256TokenValidator::new(b"s3cret".to_vec());
        assert_eq!(
            validator.validate(&token, now),
            Err(TokenValidationError::Expired)
        );
    }
}
