//! Route handlers.

use axum::Json;
use serde_json::{json, Value};

/// Liveness probe. Never metered.
pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// The metered resource.
pub async fn resource() -> Json<Value> {
    Json(json!({ "message": "protected resource accessed" }))
}
