//! Intake agent - scripted patient intake over a messaging session
//!
//! Keeps one messaging session alive, walks each correspondent through the
//! intake dialogue and forwards completed intakes to a notification webhook.

mod config;
mod notify;
mod runtime;
mod state_machine;
mod store;
mod transport;
mod validation;

use config::Config;
use notify::{LogGateway, WebhookGateway};
use runtime::{IntakeService, NotificationGateway};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::RelayConnector;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "intake_agent=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env();
    let spec = config.session_spec();

    // The transport owns what goes in here; we only make sure the parent exists
    std::fs::create_dir_all(&config.session_dir)?;

    let gateway: Arc<dyn NotificationGateway> = match &config.notify_url {
        Some(url) => {
            tracing::info!(url = %url, "Posting notifications to webhook");
            Arc::new(WebhookGateway::new(url.as_str(), config.timings.notify_timeout)?)
        }
        None => {
            tracing::warn!("INTAKE_NOTIFY_URL not set; notifications are only logged");
            Arc::new(LogGateway)
        }
    };

    tracing::info!(
        session_id = %spec.session_id,
        credentials_dir = %spec.credentials_dir.display(),
        relay = %config.relay_addr,
        "Starting intake agent"
    );

    let service = IntakeService::spawn(
        spec,
        Arc::new(RelayConnector::new(config.relay_addr.as_str())),
        gateway,
        config.timings.clone(),
    );
    service.start().await;

    wait_for_signal().await?;
    let status = service.sessions().status();
    tracing::info!(
        phase = %status.phase,
        generation = status.generation,
        retry_pending = status.retry_pending,
        "Shutdown requested"
    );
    service.shutdown().await;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
