//! smtprelayd - multi-tenant SMTP relay daemon

use anyhow::Result;
use smtprelay_common::event::EventLog;
use smtprelay_core::store::spawn_reload_listener;
use smtprelay_core::{ConfigStore, GraphClient, RateLimiter, SmtpServer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config_root = config_root();
    info!(root = %config_root.display(), "starting smtprelayd");

    let store = Arc::new(ConfigStore::open(&config_root)?);
    let limiter = Arc::new(RateLimiter::new());
    let events = EventLog::new(config_root.join("logs").join("relay.jsonl"));

    // Reloads arrive through the in-process channel; SIGHUP feeds it so
    // the administrative layer can poke a running daemon.
    let reload = spawn_reload_listener(store.clone());
    {
        let reload = reload.clone();
        let mut hup = signal(SignalKind::hangup())?;
        tokio::spawn(async move {
            while hup.recv().await.is_some() {
                info!("SIGHUP received, reloading configuration");
                reload.trigger();
            }
        });
    }

    let server = Arc::new(SmtpServer::new(store, limiter, GraphClient::new(), events));
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "SMTP relay stopped");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    server_handle.abort();
    info!("smtprelayd shutdown complete");

    Ok(())
}

/// Configuration root holding `config.json` and `tenants.d/`.
fn config_root() -> PathBuf {
    std::env::var_os("SMTPRELAY_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,smtprelay=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .init();
}
