use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use msaq_infra::Dispatcher;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /databases - Catalog database ids
pub async fn databases(Extension(dispatcher): Extension<Arc<Dispatcher>>) -> impl IntoResponse {
    Json(serde_json::json!({ "databases": dispatcher.databases() }))
}
