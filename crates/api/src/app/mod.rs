//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: job store, limiter, ingestion, workers, maintenance, reporter
//! - `routes/`: HTTP routes + handlers (webhooks, admin, system)
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
///
/// Webhook routes are mounted only when the process role ingests.
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    let auth = middleware::AdminAuth::new(services.settings.admin_token.clone());
    let admin = routes::admin::router()
        .layer(axum::middleware::from_fn_with_state(auth, middleware::admin_auth));

    let mut app = routes::public_router().nest("/admin", admin);
    if services.config.role.serves_webhooks() {
        app = app.nest("/webhooks", routes::webhooks::router());
    }

    app.layer(Extension(services)).layer(ServiceBuilder::new())
}
