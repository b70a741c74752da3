use axum::{Router, routing::get};

pub mod admin;
pub mod system;
pub mod webhooks;

/// Public endpoints (liveness).
pub fn public_router() -> Router {
    Router::new().route("/health", get(system::health))
}
