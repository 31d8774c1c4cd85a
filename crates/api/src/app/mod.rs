//! HTTP application wiring (Axum router + engine wiring).
//!
//! Layout:
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs and wire mapping
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use jobrelay_engine::Engine;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;

/// Build the full HTTP router (public entrypoint used by `main.rs` and the
/// black-box tests).
pub fn build_app(engine: Engine, jwt_secret: String) -> Router {
    let validator = Arc::new(jobrelay_auth::Hs256TokenValidator::new(
        jwt_secret.into_bytes(),
    ));
    let auth_state = middleware::AuthState { validator };

    // Protected routes: require auth + owner context.
    let protected = routes::router()
        .layer(Extension(engine))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .layer(ServiceBuilder::new())
}
