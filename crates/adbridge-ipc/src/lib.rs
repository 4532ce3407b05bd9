//! D-Bus control surface for AdBridge
//!
//! The daemon exposes three interfaces under the well-known name
//! `com.enigmora.AdBridge`:
//!
//! - `com.enigmora.AdBridge.SyncController` - reload configuration, force
//!   or resume a sync, clear the anomaly latch, query status, reset the
//!   sync database
//! - `com.enigmora.AdBridge.EventLog` - page and clear the operator event
//!   log
//! - `com.enigmora.AdBridge.AdminTools` - test admin credentials and the
//!   main-group lookup against a not-yet-persisted forest configuration

pub mod service;

pub use service::{serve, AdminToolsInterface, EventLogInterface, SyncControllerInterface};
pub use service::{DBUS_NAME, DBUS_PATH};
