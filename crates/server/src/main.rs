mod api;
mod bootstrap;
mod health;
mod notifier;

use std::time::Duration;

use anyhow::Result;
use fundflow_core::config::{AppConfig, LoadOptions};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use fundflow_core::config::LogFormat::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);

    let routes = api::router(app.service.clone(), app.shutdown.clone())
        .merge(health::router(app.db_pool.clone(), health::DEFAULT_PROBE_TIMEOUT));
    let listener = tokio::net::TcpListener::bind(&address).await?;

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "fundflow-server listening"
    );

    let stop = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(stop.clone()));

    let server = axum::serve(listener, routes).with_graceful_shutdown({
        let stop = stop.clone();
        async move { stop.cancelled().await }
    });
    let mut server = tokio::spawn(async move { server.await });

    tokio::select! {
        joined = &mut server => {
            joined??;
            return Ok(());
        }
        _ = stop.cancelled() => {}
    }
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        grace_secs = grace.as_secs(),
        "fundflow-server stopping"
    );

    match tokio::time::timeout(grace, &mut server).await {
        Ok(joined) => joined??,
        Err(_) => {
            tracing::warn!(
                event_name = "system.server.shutdown_timeout",
                correlation_id = "shutdown",
                grace_secs = grace.as_secs(),
                "grace period elapsed; cancelling in-flight transitions"
            );
            // uncommitted transitions roll back and answer 503
            app.shutdown.cancel();
            server.await??;
        }
    }

    let dropped = app.audit.dropped();
    app.db_pool.close().await;
    tracing::info!(
        event_name = "system.server.stopped",
        correlation_id = "shutdown",
        audit_events_dropped = dropped,
        "fundflow-server stopped"
    );

    Ok(())
}

async fn wait_for_shutdown(shutdown: CancellationToken) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "system.server.signal_error",
            correlation_id = "shutdown",
            error = %error,
            "failed to listen for shutdown signal"
        );
    }
    shutdown.cancel();
}
