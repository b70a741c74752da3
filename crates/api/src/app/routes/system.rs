use axum::http::StatusCode;

/// Liveness only; queue health is under `/admin/stats`.
pub async fn health() -> StatusCode {
    StatusCode::OK
}
