//! CLI command implementations
//!
//! Every command is a thin D-Bus client of the running daemon.

pub mod anomaly;
pub mod config;
pub mod events;
pub mod status;
pub mod sync;

use adbridge_ipc::{DBUS_NAME, DBUS_PATH};
use anyhow::{Context, Result};

/// Connects to the daemon and returns a proxy for the given interface
pub async fn daemon_proxy(interface: &'static str) -> Result<zbus::Proxy<'static>> {
    let connection = zbus::Connection::session()
        .await
        .context("cannot connect to the session bus; is the daemon running?")?;
    zbus::Proxy::new(&connection, DBUS_NAME, DBUS_PATH, interface)
        .await
        .context("cannot reach the AdBridge daemon")
}

pub async fn sync_controller() -> Result<zbus::Proxy<'static>> {
    daemon_proxy("com.enigmora.AdBridge.SyncController").await
}

pub async fn event_log() -> Result<zbus::Proxy<'static>> {
    daemon_proxy("com.enigmora.AdBridge.EventLog").await
}

pub async fn admin_tools() -> Result<zbus::Proxy<'static>> {
    daemon_proxy("com.enigmora.AdBridge.AdminTools").await
}
