//! D-Bus service implementation for AdBridge
//!
//! The interfaces hold a [`MonitorHandle`] rather than reaching for any
//! process-global state; everything the control surface can do goes
//! through the handle's command queue and flags.

use std::path::PathBuf;
use std::sync::Arc;

use adbridge_audit::EventLogger;
use adbridge_core::config::AdConfig;
use adbridge_core::domain::forest::Forest;
use adbridge_core::ports::{IDirectoryClient, IStore};
use adbridge_sync::admin;
use adbridge_sync::monitor::MonitorHandle;
use serde_json::json;
use tracing::{info, warn};

/// D-Bus well-known name for the AdBridge daemon
pub const DBUS_NAME: &str = "com.enigmora.AdBridge";

/// D-Bus object path for the service
pub const DBUS_PATH: &str = "/com/enigmora/AdBridge";

// ============================================================================
// SyncController interface
// ============================================================================

/// D-Bus interface for controlling synchronization
pub struct SyncControllerInterface {
    handle: MonitorHandle,
    config_path: PathBuf,
}

impl SyncControllerInterface {
    pub fn new(handle: MonitorHandle, config_path: PathBuf) -> Self {
        Self {
            handle,
            config_path,
        }
    }
}

#[zbus::interface(name = "com.enigmora.AdBridge.SyncController")]
impl SyncControllerInterface {
    /// Re-reads the configuration file and applies it to the running
    /// monitor. Returns a JSON object with `ok` and any validation errors.
    async fn reload_config(&self) -> String {
        info!(path = %self.config_path.display(), "ReloadConfig requested");
        let config = match AdConfig::load(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Cannot load configuration file");
                return json!({"ok": false, "errors": [e.to_string()]}).to_string();
            }
        };

        let errors = config.validate();
        if !errors.is_empty() {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            warn!(?messages, "Configuration rejected");
            return json!({"ok": false, "errors": messages}).to_string();
        }

        self.handle.reload_config(config).await;
        json!({"ok": true, "errors": []}).to_string()
    }

    /// Triggers a sync cycle. `is_resume` lifts the persistent-anomaly
    /// gate for exactly this cycle (and implies a full sync); `is_full`
    /// forces a full enumeration.
    async fn force_sync(&self, is_resume: bool, is_full: bool) {
        info!(is_resume, is_full, "ForceSync requested");
        self.handle.request_sync(is_resume, is_full).await;
    }

    /// Clears the anomaly latch and runs one verification sync
    async fn clear_anomaly_flag(&self) {
        info!("ClearAnomalyFlag requested");
        self.handle.clear_anomaly_flag().await;
    }

    /// Returns the status snapshot as JSON (progress bars, anomaly state)
    async fn get_sync_status(&self) -> String {
        self.handle.status_json()
    }

    /// Wipes the sync database; the next cycle starts from scratch
    async fn reset_sync_database(&self) {
        info!("ResetSyncDatabase requested");
        self.handle.reset_sync_database().await;
    }

    /// Emitted when the sync state changes
    #[zbus(signal)]
    async fn state_changed(signal_ctxt: &zbus::SignalContext<'_>, state: &str) -> zbus::Result<()>;
}

// ============================================================================
// EventLog interface
// ============================================================================

/// D-Bus interface for the operator event log
pub struct EventLogInterface {
    events: EventLogger,
    store: Arc<dyn IStore>,
}

impl EventLogInterface {
    pub fn new(events: EventLogger, store: Arc<dyn IStore>) -> Self {
        Self { events, store }
    }
}

#[zbus::interface(name = "com.enigmora.AdBridge.EventLog")]
impl EventLogInterface {
    /// Returns a page of events as a JSON array, newest first
    async fn load_event_log(&self, offset: i64, count: i64) -> String {
        let count = if count <= 0 { 30 } else { count };
        self.events.page_as_json(offset.max(0), count).await
    }

    /// Clears the whole event log
    async fn delete_event_log(&self) -> bool {
        match self.store.delete_all_events().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Cannot delete event log");
                false
            }
        }
    }
}

// ============================================================================
// AdminTools interface
// ============================================================================

/// D-Bus interface for configuration test operations
///
/// Both operations take a forest configuration as a JSON map, which lets
/// the configuration UI test credentials before persisting anything.
pub struct AdminToolsInterface {
    directory: Arc<dyn IDirectoryClient>,
}

impl AdminToolsInterface {
    pub fn new(directory: Arc<dyn IDirectoryClient>) -> Self {
        Self { directory }
    }

    fn parse_forest(forest_json: &str) -> Result<Forest, String> {
        let map: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(forest_json).map_err(|e| format!("invalid forest JSON: {e}"))?;
        Forest::from_map(map).map_err(|e| e.to_string())
    }
}

#[zbus::interface(name = "com.enigmora.AdBridge.AdminTools")]
impl AdminToolsInterface {
    /// Probes the forest's controllers with the configured service account
    /// and returns the classified result as JSON
    async fn test_admin_credentials(&self, forest_json: &str) -> String {
        let forest = match Self::parse_forest(forest_json) {
            Ok(forest) => forest,
            Err(message) => return json!({"status": "error", "message": message}).to_string(),
        };
        let status = admin::test_admin_credentials(self.directory.as_ref(), &forest).await;
        serde_json::to_string(&status).unwrap_or_default()
    }

    /// Looks up the forest's configured main group, emitting each match as
    /// a `MainGroupPartialResult` signal before returning the summary
    async fn test_main_group(
        &self,
        forest_json: &str,
        page_size: u32,
        #[zbus(signal_context)] ctxt: zbus::SignalContext<'_>,
    ) -> String {
        let forest = match Self::parse_forest(forest_json) {
            Ok(forest) => forest,
            Err(message) => {
                return json!({"status": "error", "errorMessage": message, "sampleResults": []})
                    .to_string()
            }
        };

        let page_size = if page_size == 0 { 10 } else { page_size };
        let result =
            admin::test_main_group(self.directory.as_ref(), &forest, page_size, |_| {}).await;

        for sample in &result.sample_results {
            let _ = Self::main_group_partial_result(&ctxt, &sample.to_string()).await;
        }

        serde_json::to_string(&result).unwrap_or_default()
    }

    /// Emitted once per group matched during a main-group test
    #[zbus(signal)]
    async fn main_group_partial_result(
        signal_ctxt: &zbus::SignalContext<'_>,
        group_json: &str,
    ) -> zbus::Result<()>;
}

// ============================================================================
// Service wiring
// ============================================================================

/// Registers all interfaces on the session bus under [`DBUS_NAME`]
pub async fn serve(
    handle: MonitorHandle,
    events: EventLogger,
    store: Arc<dyn IStore>,
    directory: Arc<dyn IDirectoryClient>,
    config_path: PathBuf,
) -> zbus::Result<zbus::Connection> {
    let connection = zbus::connection::Builder::session()?
        .name(DBUS_NAME)?
        .serve_at(DBUS_PATH, SyncControllerInterface::new(handle, config_path))?
        .serve_at(DBUS_PATH, EventLogInterface::new(events, store))?
        .serve_at(DBUS_PATH, AdminToolsInterface::new(directory))?
        .build()
        .await?;
    info!(name = DBUS_NAME, "D-Bus control surface registered");
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use adbridge_core::domain::forest::DomainController;
    use adbridge_core::domain::newtypes::ObjectGuid;

    #[test]
    fn test_parse_forest_round_trip() {
        let forest = Forest {
            object_guid: ObjectGuid::new("F1").unwrap(),
            user_name: "svc".to_string(),
            password: "pw".to_string(),
            sync_group: "qliqConnect".to_string(),
            domain_controllers: vec![DomainController::new("dc1", true)],
        };
        let json = serde_json::Value::Object(forest.to_map()).to_string();
        let parsed = AdminToolsInterface::parse_forest(&json).unwrap();
        assert_eq!(parsed, forest);
    }

    #[test]
    fn test_parse_forest_rejects_garbage() {
        assert!(AdminToolsInterface::parse_forest("not json").is_err());
        assert!(AdminToolsInterface::parse_forest("{}").is_err());
    }
}
