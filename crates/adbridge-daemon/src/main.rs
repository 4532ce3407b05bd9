//! AdBridge Daemon - Background directory synchronization service
//!
//! This binary runs unattended on an on-premises host and handles:
//! - Periodic directory polling and delta synchronization
//! - Pushing net changes to the cloud identity provider
//! - The D-Bus control surface for the CLI and configuration UI
//! - State persistence in the local SQLite cache

use std::path::PathBuf;
use std::sync::Arc;

use adbridge_audit::EventLogger;
use adbridge_core::config::AdConfig;
use adbridge_core::ports::{IDirectoryClient, IStore};
use adbridge_directory::LdapDirectoryClient;
use adbridge_store::{DatabasePool, SqliteStore};
use adbridge_sync::AdMonitor;
use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(AdConfig::default_path)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path();
    let config = AdConfig::load_or_default(&config_path);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(path = %config_path.display(), "AdBridge daemon starting");

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for e in &validation_errors {
            error!(field = %e.field, "{}", e.message);
        }
        anyhow::bail!("configuration is invalid, refusing to start");
    }

    let pool = DatabasePool::new(&config.database.path)
        .await
        .context("failed to open the state database")?;
    let store: Arc<dyn IStore> = Arc::new(SqliteStore::new(pool.pool().clone()));
    let directory: Arc<dyn IDirectoryClient> = Arc::new(LdapDirectoryClient::new());
    let events = EventLogger::new(store.clone());

    let forests = config.forests.clone();
    let (monitor, handle) = AdMonitor::new(store.clone(), directory.clone(), config);
    let worker = tokio::spawn(monitor.run());

    // Reconcile the configured forests against the store before the first
    // cycle; the diff-apply also kicks off a sync when anything changed
    handle.save_forests(forests).await;

    // The control surface is optional: a headless host without a session
    // bus still syncs, it just cannot be driven interactively
    let _connection = match adbridge_ipc::serve(
        handle.clone(),
        events,
        store.clone(),
        directory.clone(),
        config_path.clone(),
    )
    .await
    {
        Ok(connection) => Some(connection),
        Err(e) => {
            warn!(error = %e, "Cannot register the D-Bus control surface, continuing without it");
            None
        }
    };

    shutdown_signal().await;
    info!("Shutdown signal received, stopping the sync worker");

    handle.request_stop().await;
    handle.wait_for_stopped().await;
    let _ = worker.await;

    info!("AdBridge daemon stopped");
    Ok(())
}

/// Completes on SIGTERM or Ctrl-C
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
