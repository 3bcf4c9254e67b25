//! HTTP server for the switch port webhook.
//!
//! # Endpoints
//!
//! - `POST /webhook` - Accepts reservation lifecycle events and reconciles the switch
//! - `GET /healthz` - Returns 200 if the server is running

use std::sync::Arc;

use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};

use crate::notify::Notifier;
use crate::reconcile::Reconciler;
use crate::switch::SwitchConnector;
use crate::webhooks::SignatureVerifier;

pub mod access_log;
pub mod health;
pub mod webhook;

pub use access_log::AccessLogConfig;
pub use health::health_handler;
pub use webhook::{WebhookError, webhook_handler};

pub const WEBHOOK_PATH: &str = "/webhook";
pub const HEALTHZ_PATH: &str = "/healthz";

/// Shared application state.
///
/// This is passed to all handlers via Axum's `State` extractor.
pub struct AppState<C> {
    inner: Arc<AppStateInner<C>>,
}

struct AppStateInner<C> {
    reconciler: Reconciler<C>,
    verifier: SignatureVerifier,
    notifier: Notifier,
}

// Manual impl: cloning shares the inner state and needs no `C: Clone`.
impl<C> Clone for AppState<C> {
    fn clone(&self) -> Self {
        AppState {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: SwitchConnector> AppState<C> {
    pub fn new(reconciler: Reconciler<C>, verifier: SignatureVerifier, notifier: Notifier) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                reconciler,
                verifier,
                notifier,
            }),
        }
    }

    pub fn reconciler(&self) -> &Reconciler<C> {
        &self.inner.reconciler
    }

    pub fn verifier(&self) -> &SignatureVerifier {
        &self.inner.verifier
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router<C: SwitchConnector>(app_state: AppState<C>, access_log: AccessLogConfig) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(webhook_handler::<C>))
        .route(HEALTHZ_PATH, get(health_handler))
        .layer(from_fn_with_state(access_log, access_log::access_log))
        .with_state(app_state)
}
