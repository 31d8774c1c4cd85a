use axum::Router;

pub mod jobs;
pub mod system;

/// Routes requiring an authenticated owner context.
pub fn router() -> Router {
    Router::new().nest("/jobs", jobs::router())
}
