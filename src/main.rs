use std::net::SocketAddr;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use switchport_webhook::config::Config;
use switchport_webhook::reconcile::Reconciler;
use switchport_webhook::server::{AppState, build_router};
use switchport_webhook::switch::ssh::SshConnector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
        .to_ascii_lowercase();
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("switchport_webhook={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    if config.webhook_secret.is_none() {
        warn!("WEBHOOK_SECRET not set, webhook signatures will not be verified");
    }
    if config.notification.is_none() {
        warn!("NOTIFICATION_ENDPOINT not set, outcome notifications disabled");
    }
    if config.webhook_log.is_none() {
        warn!("WEBHOOK_LOG_ENDPOINT not set, webhook logging disabled");
    }

    let connector = SshConnector::new(config.ssh_target(), config.cli_dialect());
    let reconciler = Reconciler::new(connector, config.reconcile_settings());
    let state = AppState::new(reconciler, config.signature_verifier(), config.notifier());
    let app = build_router(state, config.access_log());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        %addr,
        switch = %config.switch.host,
        device_type = ?config.switch.device_type,
        default_vlan = %config.default_vlan,
        "Switch port webhook listening"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Cannot listen for shutdown signal");
                return;
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("server error")?;

    info!("Server stopped");
    Ok(())
}
