//! `jobrelay-api` — HTTP surface of the job control plane.

pub mod app;
pub mod context;
pub mod middleware;
