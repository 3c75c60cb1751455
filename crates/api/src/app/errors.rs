use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use msaq_core::RequestError;
use msaq_infra::jobs::JobSystemError;
use msaq_infra::DispatchError;

pub fn dispatch_error_to_response(err: DispatchError) -> axum::response::Response {
    match err {
        DispatchError::Request(e) => request_error_to_response(e),
        DispatchError::Jobs(e) => job_error_to_response(e),
    }
}

pub fn request_error_to_response(err: RequestError) -> axum::response::Response {
    match err {
        RequestError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        RequestError::UnknownDatabase(name) => json_error(
            StatusCode::BAD_REQUEST,
            "unknown_database",
            format!("unknown database: {name}"),
        ),
        RequestError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
    }
}

pub fn job_error_to_response(err: JobSystemError) -> axum::response::Response {
    match err {
        e @ JobSystemError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", e.to_string()),
        e @ JobSystemError::NotReady { .. } => json_error(StatusCode::CONFLICT, "not_ready", e.to_string()),
        e @ JobSystemError::StoreUnavailable(_) => {
            tracing::warn!(error = %e, "job store unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", e.to_string())
        }
        e @ (JobSystemError::InvalidTransition { .. } | JobSystemError::Storage(_)) => {
            tracing::error!(error = %e, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
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

/// Error for a blocking task that never returned (panicked or was cancelled).
pub fn task_failed(err: tokio::task::JoinError) -> axum::response::Response {
    tracing::error!(error = %err, "blocking task failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error")
}
