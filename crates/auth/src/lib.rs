//! `jobrelay-auth` — access-token boundary for the control plane.
//!
//! This crate resolves a presented credential to an owner hash and nothing
//! more. The engine never sees raw secrets; by the time a request reaches
//! it, only the resolved [`jobrelay_core::OwnerHash`] remains.

pub mod claims;
pub mod validator;

pub use claims::{AccessClaims, TokenValidationError, validate_claims};
pub use validator::{Hs256TokenValidator, TokenValidator};
