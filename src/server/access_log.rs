//! Request logging middleware.

use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

use super::HEALTHZ_PATH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessLogConfig {
    /// Skip `/healthz`, which infrastructure health checks hit every few seconds.
    pub suppress_healthz: bool,
}

impl AccessLogConfig {
    pub fn should_log(&self, path: &str) -> bool {
        !(self.suppress_healthz && path == HEALTHZ_PATH)
    }
}

/// Logs method, path, status and latency of each request.
pub async fn access_log(
    State(config): State<AccessLogConfig>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    if config.should_log(&path) {
        info!(
            %method,
            %path,
            status = response.status().as_u16(),
            latency_ms = started.elapsed().as_millis() as u64,
            "HTTP request"
        );
    }
    response
}
