//! Best-effort outcome reporting.
//!
//! Two optional endpoints receive a record for every reconciliation:
//! - the notification endpoint gets a short user-facing message
//! - the webhook-log endpoint gets the request and response bodies
//!
//! Delivery runs on its own task after the HTTP response is decided. Failures
//! are logged at warn and go no further.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::webhooks::{SIGNATURE_HEADER, compute_signature, format_signature_header};

/// `eventType` of every notification record.
pub const NOTIFICATION_EVENT_TYPE: &str = "SWITCH_PORT_CONFIG";

const MAX_MESSAGE_CHARS: usize = 500;
const MAX_TYPE_CHARS: usize = 50;
const MAX_LOG_CHARS: usize = 4000;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} responded with {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
}

/// An outbound URL and its request timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub timeout: Duration,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Endpoint {
            url: url.into(),
            timeout,
        }
    }
}

/// Everything reported about one reconciliation.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    pub event_id: String,
    /// Wire name of the inbound event type, e.g. `EVENT_START`.
    pub event_type: String,
    pub webhook_id: Option<String>,
    pub user_id: Option<String>,
    pub resource_id: Option<String>,
    pub interface: String,
    pub success: bool,
    pub error: Option<String>,
    pub status_code: u16,
    /// Inbound request body, as received.
    pub request_body: String,
    /// Response body returned to the caller.
    pub response_body: String,
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub webhook_id: Option<String>,
    pub user_id: Option<String>,
    pub message: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub event_id: String,
    pub resource_id: Option<String>,
    pub event_type: &'static str,
    pub metadata: serde_json::Value,
}

impl NotificationPayload {
    pub fn from_outcome(outcome: &Outcome) -> Self {
        let (message, message_type) = if outcome.success {
            (
                format!("Switch port '{}' configured successfully", outcome.interface),
                "SUCCESS",
            )
        } else {
            let mut message = format!("Failed to configure switch port '{}'", outcome.interface);
            if let Some(error) = &outcome.error {
                message.push_str(": ");
                message.push_str(error);
            }
            (message, "ERROR")
        };

        NotificationPayload {
            webhook_id: outcome.webhook_id.clone(),
            user_id: outcome.user_id.clone(),
            message: truncate(&message, MAX_MESSAGE_CHARS),
            message_type: truncate(message_type, MAX_TYPE_CHARS),
            event_id: outcome.event_id.clone(),
            resource_id: outcome.resource_id.clone(),
            event_type: NOTIFICATION_EVENT_TYPE,
            metadata: json!({ "resourceName": outcome.interface }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookLogPayload {
    pub webhook_id: Option<String>,
    pub event_type: String,
    pub payload: String,
    pub success: bool,
    pub status_code: u16,
    pub response: String,
    pub retry_count: u32,
    pub resource_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl WebhookLogPayload {
    pub fn from_outcome(outcome: &Outcome) -> Self {
        WebhookLogPayload {
            webhook_id: outcome.webhook_id.clone(),
            event_type: outcome.event_type.clone(),
            payload: truncate(&outcome.request_body, MAX_LOG_CHARS),
            success: outcome.success,
            status_code: outcome.status_code,
            response: truncate(&outcome.response_body, MAX_LOG_CHARS),
            retry_count: outcome.retries,
            resource_id: outcome.resource_id.clone(),
            metadata: json!({
                "eventId": outcome.event_id,
                "resourceName": outcome.interface,
            }),
        }
    }
}

/// Shortens `s` to at most `max` characters, ending in `...` when cut.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// Posts outcome records to the configured endpoints.
#[derive(Debug, Clone)]
pub struct Notifier {
    client: reqwest::Client,
    notification: Option<Endpoint>,
    webhook_log: Option<Endpoint>,
    secret: Option<Arc<[u8]>>,
}

impl Notifier {
    /// `secret`, when set, signs every outbound body the same way inbound
    /// deliveries are signed.
    pub fn new(
        notification: Option<Endpoint>,
        webhook_log: Option<Endpoint>,
        secret: Option<&[u8]>,
    ) -> Self {
        Notifier {
            client: reqwest::Client::new(),
            notification,
            webhook_log,
            secret: secret.filter(|s| !s.is_empty()).map(Arc::from),
        }
    }

    /// A notifier with no endpoints.
    pub fn disabled() -> Self {
        Self::new(None, None, None)
    }

    pub fn is_enabled(&self) -> bool {
        self.notification.is_some() || self.webhook_log.is_some()
    }

    /// Delivers `outcome` in the background.
    pub fn spawn(&self, outcome: Outcome) -> JoinHandle<()> {
        let notifier = self.clone();
        tokio::spawn(async move { notifier.deliver(&outcome).await })
    }

    /// Sends `outcome` to every configured endpoint, logging failures.
    pub async fn deliver(&self, outcome: &Outcome) {
        if let Some(endpoint) = &self.notification {
            info!(
                event_id = %outcome.event_id,
                interface = %outcome.interface,
                success = outcome.success,
                "Sending switch port notification"
            );
            let payload = NotificationPayload::from_outcome(outcome);
            if let Err(e) = self.post(endpoint, &payload).await {
                warn!(event_id = %outcome.event_id, error = %e, "Notification delivery failed");
            }
        } else {
            debug!("No notification endpoint configured, skipping notification");
        }

        if let Some(endpoint) = &self.webhook_log {
            let payload = WebhookLogPayload::from_outcome(outcome);
            if let Err(e) = self.post(endpoint, &payload).await {
                warn!(event_id = %outcome.event_id, error = %e, "Webhook log delivery failed");
            }
        } else {
            debug!("No webhook log endpoint configured, skipping webhook log");
        }
    }

    async fn post<T: Serialize>(
        &self,
        endpoint: &Endpoint,
        payload: &T,
    ) -> Result<(), NotificationError> {
        let body = serde_json::to_vec(payload)?;

        let mut request = self
            .client
            .post(&endpoint.url)
            .timeout(endpoint.timeout)
            .header(CONTENT_TYPE, "application/json");
        if let Some(secret) = &self.secret {
            let signature = format_signature_header(&compute_signature(&body, secret));
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|source| NotificationError::Request {
                url: endpoint.url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::Status {
                url: endpoint.url.clone(),
                status,
            });
        }
        debug!(url = %endpoint.url, %status, "Outcome delivered");
        Ok(())
    }
}
