//! Directory synchronization engine for AdBridge
//!
//! The pieces that make up the sync core:
//!
//! - [`comparator::ForestComparator`] diffs forest configurations into an
//!   edit script the store applies transactionally.
//! - [`dc_manager::DomainControllerManager`] owns the configured forests
//!   and picks a reachable controller for each cycle.
//! - [`monitor::AdMonitor`] is the orchestrator: timer, full/delta
//!   decision, group and user processing, deletion detection, lifecycle.
//! - [`anomaly::AnomalyDetector`] gates mass deletions across two
//!   consecutive runs.
//! - [`pusher::AdToWebPusher`] drains local changes to the cloud with
//!   conflict resolution and permanent-error quarantine.
//! - [`admin`] hosts the configuration test operations of the control
//!   surface.

pub mod admin;
pub mod anomaly;
pub mod comparator;
pub mod dc_manager;
pub mod monitor;
pub mod pusher;

pub use anomaly::{AnomalyDetector, AnomalyStatus};
pub use comparator::ForestComparator;
pub use dc_manager::DomainControllerManager;
pub use monitor::{AdMonitor, MonitorCommand, MonitorFlags, MonitorHandle};
pub use pusher::{AdToWebPusher, PushOutcome};
