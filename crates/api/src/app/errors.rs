use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use dmflow_infra::{IngestError, JobStoreError};

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        JobStoreError::Unavailable(msg) => {
            tracing::error!(error = %msg, "job store unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
        JobStoreError::Storage(msg) => {
            tracing::error!(error = %msg, "job store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
        JobStoreError::Serialization(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization_error", msg)
        }
    }
}

/// Any non-2xx asks the provider to redeliver; redeliveries are deduplicated.
pub fn ingest_error_to_response(err: IngestError) -> axum::response::Response {
    match err {
        IngestError::Timeout(after) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "enqueue_timeout",
            format!("job store did not answer within {}ms", after.as_millis()),
        ),
        IngestError::Store(e) if e.is_transient() => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", e.to_string())
        }
        IngestError::Store(e) => store_error_to_response(e),
        IngestError::Encode(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "encode_error", msg),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
