use std::sync::Arc;

use anyhow::Context as _;
use hass_ingest::config::{IngestConfig, LogFormat};
use hass_ingest::forward::Forwarder;
use hass_ingest::server::HealthServer;
use hass_ingest::transport::tungstenite::TungsteniteTransport;
use hass_ingest::ws::{IngestActor, Start, Stop};
use kameo::Actor;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_tracing(config: &IngestConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.log_format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Pretty => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = IngestConfig::from_env().context("invalid configuration")?;
    init_tracing(&config);

    let sink = config.http_sink().context("building forwarding client")?;
    info!(
        upstream = %config.home_assistant_url,
        downstream = %sink.url(),
        "configuration loaded"
    );
    let forwarder = Forwarder::new(Arc::new(sink), config.forward_retry);

    let actor = IngestActor::spawn(config.actor_args(TungsteniteTransport::default(), forwarder));

    let listener = tokio::net::TcpListener::bind(config.health_bind)
        .await
        .with_context(|| format!("binding health server to {}", config.health_bind))?;
    let server = HealthServer::start(listener, actor.clone());

    actor.ask(Start).await.context("starting ingestion")?;

    shutdown_signal().await;

    if let Err(e) = actor.ask(Stop).await {
        warn!(error = %e, "stop failed");
    }
    server.abort();
    let _ = actor.stop_gracefully().await;
    actor.wait_for_shutdown().await;
    Ok(())
}
