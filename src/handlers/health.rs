use axum::{response::IntoResponse, Json};
use serde_json::json;

/// GET /health and /v1/health
pub async fn handle() -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "time": crate::converters::unix_now(),
    }))
}
