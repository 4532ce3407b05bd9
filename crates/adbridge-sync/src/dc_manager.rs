//! Forest and domain controller manager
//!
//! Owns the in-memory forest list, iterates it per sync cycle, picks a
//! reachable controller for each forest (primary first, then the
//! additional controllers in stored order) and applies configuration
//! changes through the comparator.

use std::sync::Arc;

use adbridge_audit::{ad_event, EventLogger};
use adbridge_core::domain::event::{EventCategory, EventType};
use adbridge_core::domain::forest::{DomainController, Forest};
use adbridge_core::ports::{IDirectoryClient, IStore};
use tracing::{debug, error, info};

use crate::comparator::ForestComparator;

/// Loads, iterates and reconciles the configured forests
pub struct DomainControllerManager {
    store: Arc<dyn IStore>,
    directory: Arc<dyn IDirectoryClient>,
    events: EventLogger,
    forests: Vec<Forest>,
    forest_index: usize,
    is_loaded: bool,
}

impl DomainControllerManager {
    pub fn new(
        store: Arc<dyn IStore>,
        directory: Arc<dyn IDirectoryClient>,
        events: EventLogger,
    ) -> Self {
        Self {
            store,
            directory,
            events,
            forests: Vec::new(),
            forest_index: 0,
            is_loaded: false,
        }
    }

    /// Hydrates the forest list from the store, primary controllers first
    pub async fn load(&mut self) -> anyhow::Result<()> {
        let mut forests = self.store.load_forests().await?;
        for forest in &mut forests {
            forest.sort_controllers_primary_first();
        }
        self.forests = forests;
        self.is_loaded = true;
        info!(count = self.forests.len(), "Loaded forest configuration from database");
        Ok(())
    }

    /// Drops the cached forest list; the next use reloads it
    pub fn reset(&mut self) {
        self.forests.clear();
        self.is_loaded = false;
    }

    /// Rewinds the per-cycle iteration
    pub fn reset_iteration(&mut self) {
        self.forest_index = 0;
    }

    pub fn forests(&self) -> &[Forest] {
        &self.forests
    }

    /// Returns the next forest paired with a reachable controller.
    ///
    /// Forests whose controllers all fail the reachability probe are
    /// reported and skipped for this cycle.
    pub async fn next_forest(&mut self) -> Option<(Forest, DomainController)> {
        if !self.is_loaded {
            error!("Forest configuration is not loaded, loading now");
            if let Err(e) = self.load().await {
                error!(error = %e, "Cannot load forest configuration");
                return None;
            }
        }

        while self.forest_index < self.forests.len() {
            let forest = self.forests[self.forest_index].clone();
            self.forest_index += 1;

            for controller in &forest.domain_controllers {
                let mut controller = controller.clone();
                if self.is_server_accessible(&mut controller, &forest).await {
                    return Some((forest, controller));
                }
            }

            ad_event!(
                self.events,
                EventType::Sync,
                EventCategory::Error,
                "No domain controller of forest {} is reachable, skipping it this cycle",
                forest.object_guid
            )
            .await;
        }
        None
    }

    /// Probes one controller by binding to its root and reading the DNS
    /// host name; persists the name on first success
    async fn is_server_accessible(
        &self,
        controller: &mut DomainController,
        forest: &Forest,
    ) -> bool {
        debug!(host = %controller.host, "Checking accessibility of domain controller");
        let credentials = forest.credentials_for(controller);
        match self.directory.server_info(&credentials).await {
            Ok(info) => {
                debug!(
                    host = %controller.host,
                    dns = %info.dns_host_name,
                    "Domain controller is accessible"
                );
                // The sync context identifies controllers by resolved name,
                // so it has to be persisted once known
                if controller.dns_name.is_empty() && !info.dns_host_name.is_empty() {
                    controller.dns_name = info.dns_host_name.clone();
                    if let Err(e) = self
                        .store
                        .update_controller_dns_name(
                            forest.object_guid.as_str(),
                            &controller.host,
                            &info.dns_host_name,
                        )
                        .await
                    {
                        error!(error = %e, "Cannot persist controller DNS name");
                    }
                }
                true
            }
            Err(e) => {
                error!(host = %controller.host, error = %e, "Domain controller is not accessible");
                false
            }
        }
    }

    /// Diffs and applies a new forest configuration.
    ///
    /// Invalid forests are dropped with a fatal-level event before the
    /// comparison. The in-memory list is replaced only when the
    /// transactional apply commits. Returns whether anything changed.
    pub async fn save_forests(&mut self, mut forests: Vec<Forest>) -> anyhow::Result<bool> {
        if !self.is_loaded {
            error!("Forest configuration is not loaded in save_forests, loading now");
            self.load().await?;
        }

        info!(
            new_count = forests.len(),
            old_count = self.forests.len(),
            "New forest configuration to save"
        );

        // The configuration surface validates before sending, but this is
        // critical enough to check again
        let mut index = 0;
        while index < forests.len() {
            match forests[index].validate() {
                Ok(()) => {
                    forests[index].normalize_primary();
                    forests[index].sort_controllers_primary_first();
                    index += 1;
                }
                Err(e) => {
                    ad_event!(
                        self.events,
                        EventType::Sync,
                        EventCategory::Error,
                        "Removing invalid forest configuration: {e}"
                    )
                    .await;
                    forests.remove(index);
                }
            }
        }

        let changes = ForestComparator::compare(&self.forests, &forests);
        if changes.is_empty() {
            info!("There is no change in forest configuration to apply");
            return Ok(false);
        }

        self.store.apply_forest_changes(&changes).await?;
        self.forests = forests;
        Ok(true)
    }
}
