//! Operational endpoints (bearer `ADMIN_TOKEN`).

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};

use dmflow_core::JobId;

use crate::app::dto::{DeadLetterQuery, ReapResponse, StatsResponse, WorkerStatsView};
use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/stats", get(stats))
        .route("/jobs/:id", get(get_job))
        .route("/dead-letters", get(list_dead_letters))
        .route("/dead-letters/:id", delete(delete_dead_letter))
        .route("/dead-letters/:id/requeue", post(requeue_dead_letter))
        .route("/reap", post(reap))
}

fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse::<JobId>()
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()))
}

/// GET /admin/stats - queue health computed on demand
pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let report = match services.reporter().report().await {
        Ok(report) => report,
        Err(e) => return errors::store_error_to_response(e),
    };
    let workers = services
        .worker_stats()
        .into_iter()
        .map(|(worker_id, stats)| WorkerStatsView { worker_id, stats })
        .collect();
    Json(StatsResponse { report, workers }).into_response()
}

/// GET /admin/jobs/:id - live job, or the dead-letter copy
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.store().get(id).await {
        Ok(Some(job)) => return Json(job).into_response(),
        Ok(None) => {}
        Err(e) => return errors::store_error_to_response(e),
    }
    match services.store().get_dead_letter(id).await {
        Ok(Some(entry)) => Json(entry.job).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /admin/dead-letters?limit=N - most recent first
pub async fn list_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<DeadLetterQuery>,
) -> axum::response::Response {
    match services.store().list_dead_letters(query.limit()).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /admin/dead-letters/:id/requeue - back to pending with a fresh attempt budget
pub async fn requeue_dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.store().requeue_dead_letter(id).await {
        Ok(job) => {
            tracing::info!(job_id = %id, "dead letter requeued");
            Json(job).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

/// DELETE /admin/dead-letters/:id
pub async fn delete_dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.store().delete_dead_letter(id).await {
        Ok(()) => {
            tracing::info!(job_id = %id, "dead letter deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /admin/reap - release stale claims now
pub async fn reap(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.maintenance().reap_now().await {
        Ok(job_ids) => Json(ReapResponse {
            reaped: job_ids.len(),
            job_ids,
        })
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
