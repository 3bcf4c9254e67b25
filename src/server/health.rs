//! Liveness endpoint.
//!
//! Always 200 while the process serves requests. It does not contact the
//! switch, so health checks never consume device sessions.

use axum::Json;
use serde_json::{Value, json};

/// Service name reported by `/healthz`.
pub const SERVICE_NAME: &str = "switch-port-webhook";

pub async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": SERVICE_NAME }))
}
