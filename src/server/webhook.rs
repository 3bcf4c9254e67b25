//! Webhook endpoint handler.
//!
//! Verifies the signature over the raw body, parses the event (or batch of
//! events), runs the reconciliation to completion and answers with its
//! outcome. Each outcome is handed to the notifier from the reconciling task,
//! so reports go out even if the client has gone away.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::AppState;
use crate::notify::Outcome;
use crate::reconcile::{ReconcileError, ReconcileFailure, ReconcileReport};
use crate::switch::{DeviceErrorKind, SwitchConnector};
use crate::types::{EventId, InterfaceName};
use crate::webhooks::{
    AuthError, ParsedWebhook, ReservationEvent, ReservationEventType, SIGNATURE_HEADER,
    ValidationError, VlanDesiredState, parse_webhook,
};

/// Errors that can occur when processing a webhook.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// The reconciliation task panicked or was cancelled.
    #[error("reconciliation task failed: {0}")]
    TaskFailed(String),

    /// Some events of a batch delivery failed.
    #[error(
        "processing {event_type} failed for {} of {total} Switch Port events",
        .failures.len()
    )]
    Batch {
        event_type: ReservationEventType,
        total: usize,
        failures: Vec<EventFailure>,
    },
}

/// One failed event of a batch.
#[derive(Debug)]
pub struct EventFailure {
    pub event_id: EventId,
    pub interface: InterfaceName,
    pub error: WebhookError,
}

impl WebhookError {
    pub fn status(&self) -> StatusCode {
        match self {
            WebhookError::Auth(_) => StatusCode::UNAUTHORIZED,
            WebhookError::Validation(_) => StatusCode::BAD_REQUEST,
            WebhookError::Reconcile(_) | WebhookError::TaskFailed(_) | WebhookError::Batch { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Error class reported in the response body.
    ///
    /// A batch reports the class of its first failure.
    pub fn kind(&self) -> &'static str {
        match self {
            WebhookError::Auth(_) => "AuthError",
            WebhookError::Validation(_) => "ValidationError",
            WebhookError::Reconcile(e) => match &e.failure {
                ReconcileFailure::Device(d) if d.kind == DeviceErrorKind::Command => {
                    "DeviceCommandError"
                }
                ReconcileFailure::Device(_)
                | ReconcileFailure::LockTimeout(_)
                | ReconcileFailure::BudgetExceeded { .. } => "DeviceConnectionError",
                ReconcileFailure::Convergence { .. } => "ConvergenceError",
            },
            WebhookError::TaskFailed(_) => "InternalError",
            WebhookError::Batch { failures, .. } => failures
                .first()
                .map_or("InternalError", |f| f.error.kind()),
        }
    }

    pub fn body(&self) -> Value {
        let mut body = json!({
            "status": "error",
            "error": self.kind(),
            "message": self.to_string(),
        });
        if let WebhookError::Batch { failures, .. } = self {
            body["failures"] = failures
                .iter()
                .map(|f| {
                    json!({
                        "eventId": f.event_id,
                        "interface": f.interface,
                        "error": f.error.kind(),
                        "message": f.error.to_string(),
                    })
                })
                .collect();
        }
        body
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

fn success_body(event: &ReservationEvent, report: &ReconcileReport) -> Value {
    json!({
        "status": "success",
        "message": format!(
            "Switch port '{}' configured on VLAN {}",
            report.interface, report.vlan
        ),
        "eventId": event.event_id,
        "interface": report.interface,
        "vlan": report.vlan,
        "vlanCreated": report.vlan_created,
    })
}

/// Webhook handler.
///
/// # Response
///
/// - 200 OK: the switch converged, or the event needed no action
/// - 400 Bad Request: malformed or incomplete event
/// - 401 Unauthorized: missing or wrong signature
/// - 500 Internal Server Error: device, convergence or timeout failure, or
///   any failed event of a batch
pub async fn webhook_handler<C: SwitchConnector>(
    State(app_state): State<AppState<C>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, WebhookError> {
    // Verify before parsing anything.
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    app_state.verifier().check(&body, signature)?;

    let parsed = match parse_webhook(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "Rejected invalid webhook payload");
            return Err(e.into());
        }
    };

    match parsed {
        ParsedWebhook::Ignored { reason } => {
            info!(%reason, "No action required for webhook");
            Ok(Json(json!({ "status": "success", "message": reason })))
        }
        ParsedWebhook::Reservation(event) => {
            let mut results = run_events(&app_state, vec![event], body).await?;
            match results.pop() {
                Some((_, result)) => result.map(Json),
                None => Err(WebhookError::TaskFailed("no reconciliation result".to_string())),
            }
        }
        ParsedWebhook::Batch { event_type, events } => {
            info!(%event_type, count = events.len(), "Processing batch delivery");
            let results = run_events(&app_state, events, body).await?;
            batch_response(event_type, results).map(Json)
        }
    }
}

/// Reconciles `events` one after another on a detached task, reporting each
/// outcome as it completes.
///
/// The task owns everything it needs, so a client that disconnects abandons
/// neither a run nor its report.
async fn run_events<C: SwitchConnector>(
    app_state: &AppState<C>,
    events: Vec<ReservationEvent>,
    request_body: Bytes,
) -> Result<Vec<(ReservationEvent, Result<Value, WebhookError>)>, WebhookError> {
    let app_state = app_state.clone();
    tokio::spawn(async move {
        let mut results = Vec::with_capacity(events.len());
        for event in events {
            let result = run_event(&app_state, &event, &request_body).await;
            results.push((event, result));
        }
        results
    })
    .await
    .map_err(|e| WebhookError::TaskFailed(e.to_string()))
}

async fn run_event<C: SwitchConnector>(
    app_state: &AppState<C>,
    event: &ReservationEvent,
    request_body: &[u8],
) -> Result<Value, WebhookError> {
    info!(
        event_id = %event.event_id,
        event_type = %event.event_type,
        interface = %event.resource_name,
        "Processing reservation event"
    );

    let reconciler = app_state.reconciler();
    let desired = VlanDesiredState::from_event(event, reconciler.settings().default_vlan);
    debug!(?desired, "Derived desired state");

    let (response, retries) = match reconciler.reconcile(&desired).await {
        Ok(report) => (Ok(success_body(event, &report)), report.retries),
        Err(e) => {
            let retries = e.retries;
            (Err(WebhookError::from(e)), retries)
        }
    };

    if let Err(e) = &response {
        error!(
            event_id = %event.event_id,
            interface = %event.resource_name,
            error = %e,
            "Reconciliation failed"
        );
    }

    report_outcome(app_state, event, request_body, &response, retries);
    response
}

fn batch_response(
    event_type: ReservationEventType,
    results: Vec<(ReservationEvent, Result<Value, WebhookError>)>,
) -> Result<Value, WebhookError> {
    let total = results.len();
    let mut processed = Vec::new();
    let mut failures = Vec::new();
    for (event, result) in results {
        match result {
            Ok(body) => processed.push(body),
            Err(error) => failures.push(EventFailure {
                event_id: event.event_id,
                interface: event.resource_name,
                error,
            }),
        }
    }

    if !failures.is_empty() {
        error!(
            %event_type,
            failed = failures.len(),
            total,
            "Batch delivery had failures"
        );
        return Err(WebhookError::Batch {
            event_type,
            total,
            failures,
        });
    }

    Ok(json!({
        "status": "success",
        "message": format!("Processed {} Switch Port {} events", processed.len(), event_type),
        "eventType": event_type,
        "processed": processed.len(),
        "results": processed,
    }))
}

/// Hands the outcome to the notifier without waiting for delivery.
fn report_outcome<C: SwitchConnector>(
    app_state: &AppState<C>,
    event: &ReservationEvent,
    request_body: &[u8],
    response: &Result<Value, WebhookError>,
    retries: u32,
) {
    let notifier = app_state.notifier();
    if !notifier.is_enabled() {
        return;
    }

    let (status_code, response_body, error) = match response {
        Ok(body) => (StatusCode::OK, body.clone(), None),
        Err(e) => (e.status(), e.body(), Some(e.to_string())),
    };

    notifier.spawn(Outcome {
        event_id: event.event_id.to_string(),
        event_type: event.event_type.as_str().to_string(),
        webhook_id: event.metadata.webhook_id.as_ref().map(|w| w.to_string()),
        user_id: event.metadata.user_id.clone(),
        resource_id: event.metadata.resource_id.clone(),
        interface: event.resource_name.to_string(),
        success: response.is_ok(),
        error,
        status_code: status_code.as_u16(),
        request_body: String::from_utf8_lossy(request_body).into_owned(),
        response_body: response_body.to_string(),
        retries,
    });
}
