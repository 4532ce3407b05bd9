//! AD monitor: the synchronization orchestrator
//!
//! One worker task owns the sync state machine and every store write. The
//! control surface talks to it through a [`MonitorHandle`]: commands are
//! queued messages, the stop/full-sync/resume switches are atomic flags
//! polled at cooperative checkpoints, and the status snapshot sits behind
//! a short-lived mutex.
//!
//! ## Per-forest cycle
//!
//! 1. Count the Present rows, then flip them all to Unknown.
//! 2. Load the `(forest, controller)` sync context and decide full vs.
//!    delta (forced, never-synced, or last full sync on another day).
//! 3. Look up the configured main group, capturing the server watermark
//!    observed at that moment.
//! 4. Enumerate subgroups, then the users of each subgroup. Subgroups with
//!    an unchanged `uSNChanged` reclassify their stored members in bulk
//!    instead of querying.
//! 5. On a full sync, scan the tombstone container.
//! 6. The rows still Unknown afterwards are the deletion candidates;
//!    evaluate the anomaly guard over them.
//! 7. Only a fully successful cycle commits the watermark.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use adbridge_audit::{ad_event, EventLogger};
use adbridge_core::config::AdConfig;
use adbridge_core::domain::entity::{AdGroup, AdUser, ValidState};
use adbridge_core::domain::event::{EventCategory, EventType};
use adbridge_core::domain::forest::{Credentials, DomainController, Forest};
use adbridge_core::domain::overlay::{AdStatus, DbGroup, DbUser, DbUserAvatar};
use adbridge_core::domain::status::SyncStatusSnapshot;
use adbridge_core::domain::sync_context::SyncContext;
use adbridge_core::ports::{DirectoryError, IDirectoryClient, IStore};
use adbridge_scim::payload;
use adbridge_scim::ScimClient;
use chrono::{DateTime, Datelike, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::anomaly::{AnomalyDetector, AnomalyStatus};
use crate::dc_manager::DomainControllerManager;
use crate::pusher::AdToWebPusher;

/// Cross-context switches polled at cooperative checkpoints
#[derive(Debug, Default)]
pub struct MonitorFlags {
    should_stop: AtomicBool,
    force_full_sync: AtomicBool,
    anomaly_resume: AtomicBool,
}

impl MonitorFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::Acquire)
    }

    pub fn set_should_stop(&self, value: bool) {
        self.should_stop.store(value, Ordering::Release);
    }

    pub fn force_full_sync(&self) -> bool {
        self.force_full_sync.load(Ordering::Acquire)
    }

    pub fn set_force_full_sync(&self, value: bool) {
        self.force_full_sync.store(value, Ordering::Release);
    }

    pub fn anomaly_resume(&self) -> bool {
        self.anomaly_resume.load(Ordering::Acquire)
    }

    pub fn set_anomaly_resume(&self, value: bool) {
        self.anomaly_resume.store(value, Ordering::Release);
    }
}

/// Commands queued from the control context to the worker
#[derive(Debug)]
pub enum MonitorCommand {
    /// Operator-requested sync. Resume lifts the persistent-anomaly gate
    /// for exactly one cycle and implies a full sync.
    RequestSync { is_resume: bool, is_full: bool },
    /// Operator cleared the anomaly latch; runs one verification sync
    ClearAnomalyFlag,
    /// New forest configuration to diff-apply
    SaveForests(Vec<Forest>),
    /// Full configuration replacement (the worker is already stopped)
    ReloadConfig(Box<AdConfig>),
    /// Wipe the sync database and reload
    ResetSyncDatabase,
    /// Terminate the worker loop
    Stop,
}

/// Control-context view of the monitor
#[derive(Clone)]
pub struct MonitorHandle {
    cmd_tx: mpsc::Sender<MonitorCommand>,
    flags: Arc<MonitorFlags>,
    status: Arc<Mutex<SyncStatusSnapshot>>,
    in_progress_rx: watch::Receiver<bool>,
}

impl MonitorHandle {
    /// Serializes the current status snapshot
    pub fn status_json(&self) -> String {
        self.status.lock().unwrap().to_json()
    }

    pub fn status_snapshot(&self) -> SyncStatusSnapshot {
        self.status.lock().unwrap().clone()
    }

    pub fn flags(&self) -> &Arc<MonitorFlags> {
        &self.flags
    }

    /// Queues an operator sync request
    pub async fn request_sync(&self, is_resume: bool, is_full: bool) {
        let _ = self
            .cmd_tx
            .send(MonitorCommand::RequestSync { is_resume, is_full })
            .await;
    }

    pub async fn clear_anomaly_flag(&self) {
        let _ = self.cmd_tx.send(MonitorCommand::ClearAnomalyFlag).await;
    }

    pub async fn save_forests(&self, forests: Vec<Forest>) {
        let _ = self.cmd_tx.send(MonitorCommand::SaveForests(forests)).await;
    }

    /// Applies a new configuration: stops an in-flight sync first, then
    /// hands the configuration to the worker, which restarts itself
    pub async fn reload_config(&self, config: AdConfig) {
        if self.status.lock().unwrap().is_ad_sync_in_progress {
            self.flags.set_should_stop(true);
            self.wait_for_stopped().await;
        }
        let _ = self
            .cmd_tx
            .send(MonitorCommand::ReloadConfig(Box::new(config)))
            .await;
    }

    pub async fn reset_sync_database(&self) {
        if self.status.lock().unwrap().is_ad_sync_in_progress {
            self.flags.set_should_stop(true);
            self.wait_for_stopped().await;
        }
        let _ = self.cmd_tx.send(MonitorCommand::ResetSyncDatabase).await;
    }

    /// Cooperative, idempotent stop request
    pub async fn request_stop(&self) {
        self.flags.set_should_stop(true);
        let _ = self.cmd_tx.send(MonitorCommand::Stop).await;
    }

    /// Blocks until the worker reports no sync in progress
    pub async fn wait_for_stopped(&self) {
        let mut rx = self.in_progress_rx.clone();
        loop {
            let in_progress = *rx.borrow();
            if !in_progress {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Enumeration context of one group, carried into the per-group user pass
#[derive(Debug, Clone)]
struct AdGroupContext {
    object_guid: String,
    distinguished_name: String,
    /// Whether the group's `uSNChanged` moved since the last sync; decides
    /// member re-enumeration vs. bulk reclassification
    is_usn_changed: bool,
    usn_changed: String,
}

/// Per-kind counters of one forest cycle
#[derive(Debug, Default, Clone, Copy)]
struct Stats {
    total: i64,
    new_count: i64,
    changed: i64,
    deleted: i64,
    invalid: i64,
    in_db_before: i64,
    in_db_after: i64,
}

impl Stats {
    fn all_changes(&self) -> i64 {
        self.new_count + self.changed + self.deleted
    }

    fn format(&self) -> String {
        let mut text = format!("changes to sync: {}, retrieved: {}", self.all_changes(), self.total);
        if self.new_count > 0 {
            text.push_str(&format!(", new: {}", self.new_count));
        }
        if self.changed > 0 {
            text.push_str(&format!(", changed: {}", self.changed));
        }
        if self.deleted > 0 {
            text.push_str(&format!(", deleted: {}", self.deleted));
        }
        if self.invalid > 0 {
            text.push_str(&format!(", invalid: {}", self.invalid));
        }
        text.push_str(&format!(
            ", in db before: {}, after: {}",
            self.in_db_before, self.in_db_after
        ));
        text
    }
}

#[derive(Debug, Default)]
struct ProcessResult {
    is_new: bool,
    changed: bool,
}

/// A forest cycle aborts on either a directory failure (classified for
/// operator reporting) or a store failure (logged, cycle terminated)
enum CycleError {
    Directory(DirectoryError),
    Store(anyhow::Error),
}

impl From<anyhow::Error> for CycleError {
    fn from(e: anyhow::Error) -> Self {
        CycleError::Store(e)
    }
}

/// The sync orchestrator; owned by a single worker task
pub struct AdMonitor {
    store: Arc<dyn IStore>,
    directory: Arc<dyn IDirectoryClient>,
    config: AdConfig,
    events: EventLogger,
    flags: Arc<MonitorFlags>,
    status: Arc<Mutex<SyncStatusSnapshot>>,
    in_progress_tx: watch::Sender<bool>,
    cmd_rx: Option<mpsc::Receiver<MonitorCommand>>,
    dc_manager: DomainControllerManager,
    anomaly: AnomalyDetector,
    sync_count: u64,
    last_sync_start: Option<DateTime<Utc>>,
    previous_total_changes: i64,
    was_auth_error_reported: bool,
    was_connection_error_reported: bool,
}

impl AdMonitor {
    /// Builds the monitor and its control handle
    pub fn new(
        store: Arc<dyn IStore>,
        directory: Arc<dyn IDirectoryClient>,
        config: AdConfig,
    ) -> (Self, MonitorHandle) {
        let events = EventLogger::new(store.clone());
        let flags = Arc::new(MonitorFlags::new());
        let status = Arc::new(Mutex::new(SyncStatusSnapshot::default()));
        let (in_progress_tx, in_progress_rx) = watch::channel(false);
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let handle = MonitorHandle {
            cmd_tx,
            flags: flags.clone(),
            status: status.clone(),
            in_progress_rx,
        };

        let dc_manager =
            DomainControllerManager::new(store.clone(), directory.clone(), events.clone());

        let monitor = Self {
            store,
            directory,
            config,
            events,
            flags,
            status,
            in_progress_tx,
            cmd_rx: Some(cmd_rx),
            dc_manager,
            anomaly: AnomalyDetector::new(),
            sync_count: 0,
            last_sync_start: None,
            previous_total_changes: 0,
            was_auth_error_reported: false,
            was_connection_error_reported: false,
        };
        (monitor, handle)
    }

    /// Worker main loop: a one-minute timer plus the command queue
    pub async fn run(mut self) {
        info!("AD monitor starting");
        let Some(mut cmd_rx) = self.cmd_rx.take() else {
            error!("Monitor started twice, refusing to run");
            return;
        };
        if let Err(e) = self.dc_manager.load().await {
            error!(error = %e, "Cannot load forest configuration at startup");
        }

        let mut timer = tokio::time::interval(std::time::Duration::from_secs(60));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.on_timer_tick().await;
                }
                command = cmd_rx.recv() => {
                    match command {
                        Some(MonitorCommand::RequestSync { is_resume, is_full }) => {
                            self.on_request_sync(is_resume, is_full).await;
                        }
                        Some(MonitorCommand::ClearAnomalyFlag) => {
                            debug!("Clear anomaly flag requested by operator");
                            self.anomaly.clear();
                            self.publish_anomaly_status();
                            self.single_run().await;
                        }
                        Some(MonitorCommand::SaveForests(forests)) => {
                            if self.save_forests(forests).await {
                                self.single_run().await;
                            }
                        }
                        Some(MonitorCommand::ReloadConfig(config)) => {
                            self.apply_config(*config).await;
                        }
                        Some(MonitorCommand::ResetSyncDatabase) => {
                            self.reset_sync_database().await;
                        }
                        Some(MonitorCommand::Stop) | None => {
                            debug!("Stop command received, leaving worker loop");
                            break;
                        }
                    }
                }
            }
        }

        self.set_sync_in_progress(false);
        info!("AD monitor stopped");
    }

    fn is_sync_in_progress(&self) -> bool {
        self.status.lock().unwrap().is_ad_sync_in_progress
    }

    fn set_sync_in_progress(&self, value: bool) {
        self.status.lock().unwrap().is_ad_sync_in_progress = value;
        let _ = self.in_progress_tx.send(value);
    }

    fn set_ad_progress(&self, text: &str, maximum: i32) {
        let mut status = self.status.lock().unwrap();
        status.ad_sync_progress.text = text.to_string();
        status.ad_sync_progress.maximum = maximum;
    }

    fn publish_anomaly_status(&self) {
        let mut status = self.status.lock().unwrap();
        status.is_anomaly_detected = self.anomaly.status() != AnomalyStatus::NoAnomaly;
        status.anomaly_message = self.anomaly.message().to_string();
        status.anomaly_not_present_user_count = self.anomaly.not_present_users();
        status.anomaly_not_present_group_count = self.anomaly.not_present_groups();
    }

    // ========================================================================
    // Command handling
    // ========================================================================

    async fn on_request_sync(&mut self, is_resume: bool, is_full: bool) {
        self.flags.set_anomaly_resume(is_resume);

        if self.flags.force_full_sync() {
            ad_event!(
                self.events,
                EventType::Sync,
                EventCategory::Warning,
                "Full Sync is already scheduled, please wait for it to finish"
            )
            .await;
            return;
        }
        if self.flags.should_stop() {
            ad_event!(
                self.events,
                EventType::Sync,
                EventCategory::Warning,
                "The service is being stopped, cannot request a sync in this state"
            )
            .await;
            return;
        }

        // An operator resume always verifies with a full pass
        let full = is_full || is_resume;
        self.flags.set_force_full_sync(full);
        let sync_type = if full { "Full" } else { "Delta" };
        ad_event!(
            self.events,
            EventType::Sync,
            EventCategory::Info,
            "{sync_type} Sync requested by user"
        )
        .await;
        self.single_run().await;
    }

    async fn save_forests(&mut self, forests: Vec<Forest>) -> bool {
        match self.dc_manager.save_forests(forests).await {
            Ok(true) => {
                ad_event!(
                    self.events,
                    EventType::Sync,
                    EventCategory::Info,
                    "Forest configurations saved in db, sync will be started"
                )
                .await;
                true
            }
            Ok(false) => false,
            Err(e) => {
                ad_event!(
                    self.events,
                    EventType::Sync,
                    EventCategory::Error,
                    "Saving forest configuration failed: {e}"
                )
                .await;
                false
            }
        }
    }

    async fn apply_config(&mut self, new_config: AdConfig) {
        let mut full_sync_required = false;

        if !new_config.sync.enable_avatars {
            if self.config.sync.enable_avatars {
                ad_event!(
                    self.events,
                    EventType::Sync,
                    EventCategory::Warning,
                    "Avatar support is switched off, deleting all avatars"
                )
                .await;
                if let Err(e) = self.store.delete_all_avatars().await {
                    error!(error = %e, "Cannot delete avatars");
                }
            }
        } else if !self.config.sync.enable_avatars && self.sync_count > 0 {
            ad_event!(
                self.events,
                EventType::Sync,
                EventCategory::Info,
                "Avatar support is switched on, triggering a full sync"
            )
            .await;
            full_sync_required = true;
        }

        if new_config.sync.enable_dn_auth && !self.config.sync.enable_dn_auth && self.sync_count > 0
        {
            ad_event!(
                self.events,
                EventType::Sync,
                EventCategory::Info,
                "DN auth is switched on, triggering a full sync"
            )
            .await;
            full_sync_required = true;
        }

        if !new_config.sync.enable_subgroups {
            match self.store.mark_deleted_unsent_groups_with_cloud_id().await {
                Ok(deleted) => {
                    ad_event!(
                        self.events,
                        EventType::Sync,
                        EventCategory::Warning,
                        "AD subgroups are disabled, deleted {deleted} existing groups"
                    )
                    .await;
                }
                Err(e) => error!(error = %e, "Cannot delete groups for disabled subgroups"),
            }
        }

        if full_sync_required {
            if let Err(e) = self.store.clear_all_last_full_sync().await {
                error!(error = %e, "Cannot reset full-sync timestamps");
            }
        }

        let was_enabled = self.config.sync.enabled;
        self.config = new_config;
        if self.config.sync.enabled && self.sync_count > 0 {
            ad_event!(
                self.events,
                EventType::Sync,
                EventCategory::Info,
                "Active Directory config changed"
            )
            .await;
        }

        let changed = self.save_forests(self.config.forests.clone()).await;
        // The handle stopped the worker before the reload; restart it now
        self.flags.set_should_stop(false);
        if self.config.sync.enabled && (changed || !was_enabled) {
            self.single_run().await;
        }
    }

    async fn reset_sync_database(&mut self) {
        info!("Resetting the sync database");
        if let Err(e) = self.store.reset_sync_database().await {
            ad_event!(
                self.events,
                EventType::Sync,
                EventCategory::Error,
                "Resetting the sync database failed: {e}"
            )
            .await;
            return;
        }
        self.dc_manager.reset();
        self.anomaly.clear();
        self.publish_anomaly_status();
        self.flags.set_should_stop(false);
        ad_event!(
            self.events,
            EventType::Sync,
            EventCategory::Info,
            "Sync database was reset"
        )
        .await;
    }

    async fn on_timer_tick(&mut self) {
        if self.is_sync_in_progress()
            || self.flags.should_stop()
            || !self.config.sync.enabled
            || self.config.sync.interval_mins < 1
        {
            debug!("Sync timer fired but the monitor is not in a runnable state");
            return;
        }

        let mins_since_last = self
            .last_sync_start
            .map(|start| (Utc::now() - start).num_minutes())
            .unwrap_or(i64::MAX);

        if self.flags.force_full_sync() || mins_since_last >= i64::from(self.config.sync.interval_mins)
        {
            self.single_run().await;
        } else if self.anomaly.status() != AnomalyStatus::PersistentAnomaly {
            let remaining = i64::from(self.config.sync.interval_mins) - mins_since_last;
            let when = if remaining > 0 {
                format!("{remaining} mins")
            } else {
                "about a minute".to_string()
            };
            self.set_ad_progress(
                &format!(
                    "Last sync: {} changes detected, next run in {when}",
                    self.previous_total_changes
                ),
                -1,
            );
        }
    }

    // ========================================================================
    // Sync cycle
    // ========================================================================

    /// One complete sync pass over all forests, then the push phase
    async fn single_run(&mut self) {
        if !self.config.sync.enabled {
            return;
        }
        if self.is_sync_in_progress() {
            return;
        }
        if !self.flags.anomaly_resume() && self.anomaly.status() == AnomalyStatus::PersistentAnomaly
        {
            error!("Skipping sync because in persistent anomaly state");
            return;
        }

        self.sync_count += 1;
        self.last_sync_start = Some(Utc::now());
        self.set_sync_in_progress(true);
        {
            let mut status = self.status.lock().unwrap();
            status.ad_sync_progress.reset();
            status.ad_sync_progress.text = "Running".to_string();
            status.ad_sync_progress.maximum = 0;
        }

        let retention_days = i64::from(self.config.sync.event_retention_days);
        match self.store.delete_events_older_than_days(retention_days).await {
            Ok(deleted) if deleted > 0 => {
                debug!(deleted, retention_days, "Pruned old events");
            }
            Err(e) => warn!(error = %e, "Cannot prune the event log"),
            _ => {}
        }

        self.retrieve_ad_changes().await;

        if self.flags.should_stop() {
            self.set_sync_in_progress(false);
            if self.flags.force_full_sync() {
                // The stop was triggered by a new full-sync request that
                // cancelled the running cycle; run the full pass now
                self.flags.set_should_stop(false);
                self.sync_count += 1;
                self.last_sync_start = Some(Utc::now());
                self.set_sync_in_progress(true);
                self.retrieve_ad_changes().await;
                self.set_sync_in_progress(false);
            }
        } else if self.anomaly.status() == AnomalyStatus::NoAnomaly {
            {
                let mut status = self.status.lock().unwrap();
                status.is_web_push_in_progress = true;
            }
            let mut pusher = self.build_pusher();
            if let Err(e) = pusher.run().await {
                error!(error = %e, "Push phase failed");
            }
            self.set_sync_in_progress(false);
        } else {
            // Anomaly armed or latched: skip the push phase entirely
            self.set_sync_in_progress(false);
        }

        self.flags.set_force_full_sync(false);
        self.flags.set_anomaly_resume(false);
        self.publish_anomaly_status();
    }

    fn build_pusher(&self) -> AdToWebPusher {
        let scim = ScimClient::new(&self.config.web.server_address, &self.config.web.api_key);
        AdToWebPusher::new(
            self.store.clone(),
            scim,
            self.events.clone(),
            self.flags.clone(),
            self.status.clone(),
            self.config.sync.enable_subgroups,
            self.config.sync.enable_avatars,
        )
    }

    async fn retrieve_ad_changes(&mut self) {
        self.dc_manager.reset_iteration();
        while !self.flags.should_stop() {
            let Some((forest, controller)) = self.dc_manager.next_forest().await else {
                break;
            };
            self.retrieve_forest_changes(&forest, &controller).await;
        }
    }

    async fn retrieve_forest_changes(&mut self, forest: &Forest, controller: &DomainController) {
        if forest.sync_group.trim().is_empty() {
            ad_event!(
                self.events,
                EventType::Sync,
                EventCategory::Error,
                "Active Directory sync failed because main group is not configured"
            )
            .await;
            self.set_ad_progress("Error: main group is not configured", -1);
            return;
        }

        match self.sync_forest(forest, controller).await {
            Ok(()) => {}
            Err(CycleError::Directory(e)) => {
                self.handle_ad_error(&e, &controller.host).await;
                self.set_ad_progress("AD error", -1);
            }
            Err(CycleError::Store(e)) => {
                ad_event!(
                    self.events,
                    EventType::Sync,
                    EventCategory::Error,
                    "Active Directory sync of forest {} failed due to a database error: {e}",
                    forest.object_guid
                )
                .await;
            }
        }
    }

    async fn sync_forest(
        &mut self,
        forest: &Forest,
        controller: &DomainController,
    ) -> Result<(), CycleError> {
        let forest_guid = forest.object_guid.as_str().to_string();
        let page_size = self.config.sync.page_size;
        let start_time = Utc::now();

        let mut group_stats = Stats::default();
        let mut user_stats = Stats::default();
        group_stats.in_db_before = self
            .store
            .count_groups_with_status_of_forest(AdStatus::Present, &forest_guid)
            .await?;
        user_stats.in_db_before = self
            .store
            .count_users_with_status_of_forest(AdStatus::Present, &forest_guid)
            .await?;

        // Everything Present becomes Unknown; enumeration reclassifies, the
        // residue defines "not present"
        self.store
            .set_status_for_present_users_of_forest(AdStatus::Unknown, &forest_guid)
            .await?;
        self.store
            .set_status_for_groups_of_forest(AdStatus::Unknown, &forest_guid)
            .await?;

        let mut context = self
            .store
            .sync_context(&forest_guid, &controller.host)
            .await?
            .unwrap_or_else(|| SyncContext::new(forest_guid.clone(), controller.host.clone()));
        context.forest_guid = forest_guid.clone();
        context.dc_host = controller.host.clone();

        let do_full_sync = self.decide_full_sync(&mut context, forest, controller).await;
        let usn_for_sync = context.highest_committed_usn.clone();
        debug!(usn = %usn_for_sync, "Retrieving changes from AD");

        let credentials = forest.credentials_for(controller);

        // Main group lookup; the watermark the server reports during this
        // query is the value committed if the whole cycle completes
        let main_filter = format!("(&(objectClass=group)(CN={}))", forest.sync_group);
        context.highest_committed_usn.clear();
        let mut group_contexts: Vec<AdGroupContext> = Vec::new();
        let mut main_group_guid = String::new();
        let main_result = self
            .enumerate_groups(
                &credentials,
                1,
                &main_filter,
                &mut context,
                true,
                &mut group_contexts,
                &mut group_stats,
                &forest_guid,
                &mut main_group_guid,
            )
            .await;

        let mut highest_usn_from_server = String::new();
        if main_result.is_ok() {
            highest_usn_from_server = context.highest_committed_usn.clone();
        }

        let mut main_group: Option<DbGroup> = None;
        if !main_group_guid.is_empty() {
            main_group = self.store.group_by_guid(&main_group_guid).await?;
            if main_group.is_none() {
                ad_event!(
                    self.events,
                    EventType::Sync,
                    EventCategory::Error,
                    "Cannot load main group from db. Probably the db is corrupted"
                )
                .await;
            }
        }

        let mut is_all_data_synced = false;
        let mut directory_error: Option<DirectoryError> = None;

        match (main_result, main_group) {
            (Err(CycleError::Store(e)), _) => return Err(CycleError::Store(e)),
            (Err(CycleError::Directory(e)), _) => directory_error = Some(e),
            (Ok(()), Some(main_group)) => {
                let sub_filter = format!(
                    "(&(objectClass=group)(memberOf={}))",
                    main_group.group.entity.distinguished_name
                );
                context.highest_committed_usn.clear();
                let sub_result = self
                    .enumerate_groups(
                        &credentials,
                        page_size,
                        &sub_filter,
                        &mut context,
                        false,
                        &mut group_contexts,
                        &mut group_stats,
                        &forest_guid,
                        &mut String::new(),
                    )
                    .await;

                match sub_result {
                    Err(CycleError::Store(e)) => return Err(CycleError::Store(e)),
                    Err(CycleError::Directory(e)) => directory_error = Some(e),
                    Ok(()) => {
                        let result = self
                            .enumerate_users_of_groups(
                                &credentials,
                                page_size,
                                do_full_sync,
                                &usn_for_sync,
                                &mut context,
                                &mut group_contexts,
                                &mut user_stats,
                                &forest_guid,
                            )
                            .await;
                        match result {
                            Err(CycleError::Store(e)) => return Err(CycleError::Store(e)),
                            Err(CycleError::Directory(e)) => directory_error = Some(e),
                            Ok(()) => {
                                if !self.flags.should_stop() {
                                    is_all_data_synced = true;
                                    if do_full_sync {
                                        context.highest_committed_usn = usn_for_sync.clone();
                                        match self
                                            .scan_deleted_users(
                                                &credentials,
                                                page_size,
                                                &mut context,
                                                &mut user_stats,
                                            )
                                            .await
                                        {
                                            Ok(()) => {}
                                            Err(CycleError::Store(e)) => {
                                                return Err(CycleError::Store(e))
                                            }
                                            Err(CycleError::Directory(e)) => {
                                                directory_error = Some(e);
                                                is_all_data_synced = false;
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            (Ok(()), None) => {
                // The query worked but nothing matched: the population is
                // genuinely empty, every residual row is a deletion
                ad_event!(
                    self.events,
                    EventType::Sync,
                    EventCategory::Error,
                    "There is no main group present, deleting all existing groups and users from db"
                )
                .await;
                is_all_data_synced = true;
            }
        }

        // A cancelled cycle left rows in Unknown that were never scanned;
        // classifying them as deleted now would be wrong
        if self.flags.should_stop() {
            return Ok(());
        }

        if let Some(e) = directory_error {
            return Err(CycleError::Directory(e));
        }

        self.was_auth_error_reported = false;
        self.was_connection_error_reported = false;

        let mut anomaly_message: Option<String> = None;
        if is_all_data_synced {
            let sample_limit = 10;
            let deleted_users_sample = self
                .store
                .users_not_present_of_forest(&forest_guid, sample_limit)
                .await?;
            let deleted_groups_sample = self
                .store
                .groups_not_present_of_forest(&forest_guid, sample_limit)
                .await?;

            user_stats.deleted += self
                .store
                .mark_users_deleted_with_status_of_forest(&forest_guid, AdStatus::Unknown)
                .await? as i64;
            // Users that dropped out of one group but stayed in another are
            // still present; resolve them so Unknown-era states never
            // survive a completed cycle
            self.store
                .set_status_for_users_of_forest(
                    AdStatus::Present,
                    AdStatus::PresentInOtherGroups,
                    &forest_guid,
                )
                .await?;
            group_stats.deleted += self
                .store
                .delete_main_groups_not_present_of_forest(&forest_guid)
                .await? as i64;
            group_stats.deleted += self
                .store
                .mark_groups_deleted_with_status_of_forest(&forest_guid, AdStatus::Unknown)
                .await? as i64;

            group_stats.in_db_after = self
                .store
                .count_groups_with_status_of_forest(AdStatus::Present, &forest_guid)
                .await?;
            user_stats.in_db_after = self
                .store
                .count_users_with_status_of_forest(AdStatus::Present, &forest_guid)
                .await?;

            if !deleted_users_sample.is_empty() {
                let logins: Vec<String> = deleted_users_sample
                    .iter()
                    .map(|u| {
                        if u.user.login().is_empty() {
                            format!("account: {}", u.user.entity.account_name)
                        } else {
                            u.user.login().to_string()
                        }
                    })
                    .collect();
                let group_names: Vec<String> = deleted_groups_sample
                    .iter()
                    .map(|g| g.display_name())
                    .collect();
                debug!(
                    users = %logins.join("; "),
                    groups = %group_names.join("; "),
                    "Sample of deleted entries after AD sync"
                );

                if self.config.anomaly.enabled {
                    let outcome = self
                        .anomaly
                        .evaluate(
                            &self.config.anomaly,
                            &self.store,
                            user_stats.deleted,
                            user_stats.in_db_before,
                            group_stats.deleted,
                        )
                        .await?;
                    if let Some(message) = outcome.self_heal_message {
                        ad_event!(
                            self.events,
                            EventType::Sync,
                            EventCategory::Warning,
                            "{message}"
                        )
                        .await;
                    }
                    anomaly_message = outcome.anomaly_message;
                } else {
                    self.anomaly.reset_status_if_not_persistent();
                }
            } else {
                self.anomaly.reset_not_present_users();
            }

            if self.flags.anomaly_resume()
                && self.anomaly.not_present_users() == 0
                && self.anomaly.status() != AnomalyStatus::NoAnomaly
            {
                debug!("Clearing anomaly because on resume sync all users are present again");
                self.anomaly.clear();
            }
        }

        let headline = if is_all_data_synced {
            "Active Directory sync completed"
        } else {
            "Active Directory sync incomplete"
        };
        let elapsed_mins = (Utc::now() - start_time).num_seconds() / 60;
        ad_event!(
            self.events,
            EventType::Sync,
            EventCategory::Info,
            "{headline}. GROUPS {}. USERS {}. Elapsed time: {elapsed_mins} minutes",
            group_stats.format(),
            user_stats.format()
        )
        .await;

        if let Some(message) = anomaly_message {
            ad_event!(self.events, EventType::Sync, EventCategory::Error, "{message}").await;
            match self.anomaly.status() {
                AnomalyStatus::FirstSeenAnomaly => self.set_ad_progress(
                    "Possible anomaly detected, it will be verified during next run",
                    -1,
                ),
                _ => self.set_ad_progress("Anomaly detected, paused", -1),
            }
        } else {
            self.previous_total_changes = user_stats.all_changes() + group_stats.all_changes();
            self.set_ad_progress(
                &format!("Just finished, {} changes detected", self.previous_total_changes),
                -1,
            );
        }

        // The watermark is the final act of a successful cycle; an
        // incomplete cycle keeps the prior known-good anchor
        if is_all_data_synced {
            context.highest_committed_usn = highest_usn_from_server;
            context.last_full_sync = Some(Utc::now());
            self.store.upsert_sync_context(&context).await?;
            debug!(usn = %context.highest_committed_usn, "Committed sync watermark");
        }

        Ok(())
    }

    async fn decide_full_sync(
        &mut self,
        context: &mut SyncContext,
        forest: &Forest,
        controller: &DomainController,
    ) -> bool {
        let (do_full_sync, reason) = if self.flags.force_full_sync() {
            (true, "full sync requested")
        } else {
            match context.last_full_sync {
                None => (true, "config changed"),
                Some(last) if last.day() != Utc::now().day() => {
                    (true, "last full sync older 1 day")
                }
                Some(_) => (false, ""),
            }
        };

        let group_info = format!("{}, DC: {}", forest.sync_group, controller.host);
        if do_full_sync {
            ad_event!(
                self.events,
                EventType::Sync,
                EventCategory::Info,
                "Full sync started for main group: {group_info} (reason: {reason})"
            )
            .await;
            context.highest_committed_usn.clear();
            self.set_ad_progress("Full Sync started", -1);
        } else {
            ad_event!(
                self.events,
                EventType::Sync,
                EventCategory::Info,
                "Delta sync started for main group: {group_info}"
            )
            .await;
            self.set_ad_progress("Delta Sync started", -1);
        }
        do_full_sync
    }

    #[allow(clippy::too_many_arguments)]
    async fn enumerate_groups(
        &mut self,
        credentials: &Credentials,
        page_size: u32,
        filter: &str,
        context: &mut SyncContext,
        is_main_group: bool,
        group_contexts: &mut Vec<AdGroupContext>,
        stats: &mut Stats,
        forest_guid: &str,
        main_group_guid: &mut String,
    ) -> Result<(), CycleError> {
        let mut pages = self
            .directory
            .open_group_search(credentials, page_size, filter, context)
            .await
            .map_err(CycleError::Directory)?;

        while let Some(page) = pages.next_page().await.map_err(CycleError::Directory)? {
            for mut group in page {
                if self.flags.should_stop() {
                    warn!("Stop requested, cancelling AD group enumeration");
                    return Ok(());
                }
                stats.total += 1;
                if is_main_group {
                    *main_group_guid = group.entity.object_guid.clone();
                }

                let result = self
                    .process_group(group_contexts, is_main_group, &mut group, forest_guid)
                    .await?;
                self.store
                    .save_forest_group_membership(forest_guid, &group.entity.object_guid)
                    .await?;

                if result.is_new {
                    stats.new_count += 1;
                } else if !group.entity.is_deleted && result.changed {
                    stats.changed += 1;
                }
                if !group.entity.is_deleted && !group.entity.valid_state.is_valid() {
                    stats.invalid += 1;
                }
            }
        }
        Ok(())
    }

    /// Users of subgroup *k* are enumerated before those of subgroup *k+1*;
    /// an unchanged subgroup reclassifies its stored members in bulk
    #[allow(clippy::too_many_arguments)]
    async fn enumerate_users_of_groups(
        &mut self,
        credentials: &Credentials,
        page_size: u32,
        do_full_sync: bool,
        usn_for_sync: &str,
        context: &mut SyncContext,
        group_contexts: &mut [AdGroupContext],
        user_stats: &mut Stats,
        forest_guid: &str,
    ) -> Result<(), CycleError> {
        for group_context in group_contexts.iter_mut() {
            if self.flags.should_stop() {
                break;
            }

            let member_filter = format!(
                "(&(objectClass=user)(objectcategory=person)(memberOf={}))",
                group_context.distinguished_name
            );
            if do_full_sync {
                group_context.is_usn_changed = true;
            }

            if !group_context.is_usn_changed && !usn_for_sync.is_empty() {
                // The subgroup did not change since the last sync: its
                // stored members are reclassified in bulk, no query needed
                debug!(
                    group = %group_context.distinguished_name,
                    "Group uSNChanged is the same, marking all existing members as present"
                );
                self.store
                    .set_status_for_members_of_group(
                        AdStatus::Present,
                        AdStatus::Unknown,
                        &group_context.object_guid,
                    )
                    .await?;
                continue;
            }

            debug!(
                group = %group_context.distinguished_name,
                full = do_full_sync,
                "Querying for all members of group"
            );
            context.highest_committed_usn.clear();
            // Members already claimed by an earlier group of this forest
            // stay present through the re-scan
            self.store
                .set_status_for_members_of_group(
                    AdStatus::PresentInOtherGroups,
                    AdStatus::Present,
                    &group_context.object_guid,
                )
                .await?;

            self.enumerate_users(credentials, page_size, &member_filter, context, do_full_sync, user_stats, forest_guid)
                .await?;

            if !self.flags.should_stop() {
                // Memberships of users no longer listed under this group
                // are dropped, then the group's watermark advances
                self.store
                    .remove_stale_members_of_group(&group_context.object_guid)
                    .await?;
                self.store
                    .update_group_usn_changed(&group_context.object_guid, &group_context.usn_changed)
                    .await?;
            }
        }
        Ok(())
    }

    async fn enumerate_users(
        &mut self,
        credentials: &Credentials,
        page_size: u32,
        filter: &str,
        context: &mut SyncContext,
        do_full_sync: bool,
        stats: &mut Stats,
        forest_guid: &str,
    ) -> Result<(), CycleError> {
        let include_avatars = self.config.sync.enable_avatars;
        let mut pages = self
            .directory
            .open_user_search(credentials, page_size, filter, context, include_avatars)
            .await
            .map_err(CycleError::Directory)?;

        while let Some(page) = pages.next_page().await.map_err(CycleError::Directory)? {
            for mut user in page {
                if self.flags.should_stop() {
                    warn!("Stop requested, cancelling AD user enumeration");
                    return Ok(());
                }
                stats.total += 1;

                let result = self.process_user(&mut user, forest_guid).await?;
                if result.is_new {
                    stats.new_count += 1;
                } else if !user.entity.is_deleted && result.changed {
                    stats.changed += 1;
                }
                if !user.entity.is_deleted && !user.entity.valid_state.is_valid() {
                    stats.invalid += 1;
                }

                if stats.total % 100 == 0 {
                    ad_event!(
                        self.events,
                        EventType::Sync,
                        EventCategory::Info,
                        "Retrieved {} users so far",
                        stats.total
                    )
                    .await;
                }
                {
                    let mut status = self.status.lock().unwrap();
                    status.ad_sync_progress.text = format!(
                        "{}, {} users",
                        if do_full_sync { "Full AD Sync" } else { "Delta AD Sync" },
                        stats.total
                    );
                    status.ad_sync_progress.value = stats.total as i32;
                }
            }
        }
        Ok(())
    }

    async fn scan_deleted_users(
        &mut self,
        credentials: &Credentials,
        page_size: u32,
        context: &mut SyncContext,
        stats: &mut Stats,
    ) -> Result<(), CycleError> {
        let mut pages = self
            .directory
            .open_deleted_user_search(credentials, page_size, context)
            .await
            .map_err(CycleError::Directory)?;

        while let Some(guids) = pages.next_page().await.map_err(CycleError::Directory)? {
            if self.flags.should_stop() {
                return Ok(());
            }
            let affected = self.store.mark_users_deleted(&guids).await?;
            stats.deleted += affected as i64;
            debug!(
                found = guids.len(),
                marked = affected,
                "Tombstone container search result"
            );
        }
        Ok(())
    }

    // ========================================================================
    // Per-entity processing
    // ========================================================================

    /// Decides insert/update/quarantine for one enumerated group and
    /// records its enumeration context for the member pass
    async fn process_group(
        &mut self,
        group_contexts: &mut Vec<AdGroupContext>,
        is_main_group: bool,
        group: &mut AdGroup,
        forest_guid: &str,
    ) -> anyhow::Result<ProcessResult> {
        let guid = group.entity.object_guid.clone();
        let mut ignore = false;
        let mut group_context = AdGroupContext {
            object_guid: guid.clone(),
            distinguished_name: group.entity.distinguished_name.clone(),
            is_usn_changed: true,
            usn_changed: group.entity.usn_changed.clone(),
        };

        let mut result = ProcessResult::default();
        match self.store.group_by_guid(&guid).await? {
            Some(mut db_group) => {
                debug!(cn = %group.entity.cn, "Existing group");
                if db_group.push.webserver_error == 404 {
                    // Cloud-deleted rows stay quarantined until their data
                    // changes enough to produce a different identity
                    ignore = true;
                    group.entity.valid_state = db_group.group.entity.valid_state;
                    ad_event!(
                        self.events,
                        EventType::Sync,
                        EventCategory::Warning,
                        "Ignoring cloud-deleted group: {}",
                        db_group.display_name()
                    )
                    .await;
                } else {
                    db_group.push.status = AdStatus::Present;
                    let usn_moved = db_group.group.entity.usn_changed != group.entity.usn_changed;
                    group_context.is_usn_changed = usn_moved;
                    let mut changed = usn_moved && !db_group.group.fields_equal(group);
                    if usn_moved {
                        debug!(
                            name = %db_group.display_name(),
                            attributes_changed = changed,
                            "uSNChanged moved for group, members need a scan"
                        );
                    }

                    if !self.config.sync.enable_subgroups {
                        group.entity.is_deleted = true;
                        if !db_group.group.entity.is_deleted {
                            changed = true;
                            debug!(
                                name = %db_group.display_name(),
                                "Deleting already pushed group because subgroups are disabled"
                            );
                        }
                    } else if !changed
                        && db_group.group.entity.is_deleted
                        && !group.entity.is_deleted
                    {
                        // Subgroups were re-enabled; resurrect the group
                        db_group.push.is_sent_to_webserver = false;
                        changed = true;
                        debug!(
                            name = %db_group.display_name(),
                            "Undeleting group because subgroups are enabled now"
                        );
                    }

                    let previous_usn = db_group.group.entity.usn_changed.clone();
                    db_group.group = group.clone();
                    if group_context.is_usn_changed {
                        // The stored watermark advances only after the
                        // group's members were successfully enumerated
                        db_group.group.entity.usn_changed = previous_usn;
                    }
                    if db_group.push.is_sent_to_webserver && changed {
                        db_group.push.is_sent_to_webserver = false;
                    }
                    if is_main_group {
                        db_group.push.is_sent_to_webserver = true;
                        db_group.is_main_group = true;
                    }
                    if changed
                        && db_group
                            .push
                            .has_permanent_error(ScimClient::permanent_errors())
                    {
                        debug!(
                            error = db_group.push.webserver_error,
                            name = %db_group.display_name(),
                            "Clearing permanent webserver error for group because AD data changed"
                        );
                        db_group.push.webserver_error = 0;
                    }
                    let valid = payload::validate_group(&db_group).is_ok();
                    db_group.group.entity.valid_state =
                        if valid { ValidState::Valid } else { ValidState::Invalid };
                    group.entity.valid_state = db_group.group.entity.valid_state;
                    db_group.forest_guid = forest_guid.to_string();
                    self.store.update_group(&db_group).await?;
                    result.changed = changed;
                }
            }
            None => {
                debug!(cn = %group.entity.cn, "New group");
                let mut db_group = DbGroup::from_ad(group.clone(), forest_guid);
                db_group.push.status = AdStatus::Present;
                if is_main_group {
                    db_group.is_main_group = true;
                }
                if is_main_group || !self.config.sync.enable_subgroups {
                    db_group.push.is_sent_to_webserver = true;
                }
                let valid = payload::validate_group(&db_group).is_ok();
                db_group.group.entity.valid_state =
                    if valid { ValidState::Valid } else { ValidState::Invalid };
                group.entity.valid_state = db_group.group.entity.valid_state;
                self.store.insert_group(&db_group).await?;
                result.is_new = true;
            }
        }

        if !ignore {
            group_contexts.push(group_context);
        }
        Ok(result)
    }

    /// Decides insert/update/quarantine/skip for one enumerated user
    async fn process_user(
        &mut self,
        user: &mut AdUser,
        forest_guid: &str,
    ) -> anyhow::Result<ProcessResult> {
        let guid = user.entity.object_guid.clone();
        let mut result = ProcessResult::default();

        // A disabled account never seen before is not worth a row
        if user.is_disabled() && !self.store.user_exists(&guid).await? {
            ad_event!(
                self.events,
                EventType::Sync,
                EventCategory::Info,
                "User account is disabled: {}",
                user.entity.account_name
            )
            .await;
            return Ok(result);
        }

        if user.user_principal_name.is_empty() {
            user.entity.valid_state = ValidState::Invalid;
            ad_event!(
                self.events,
                EventType::Sync,
                EventCategory::Error,
                "Skipping user without userPrincipalName attribute, accountName: {}",
                user.entity.account_name
            )
            .await;
            return Ok(result);
        }

        let mut current_groups = Vec::new();
        let mut current_group_ids = std::collections::HashSet::new();
        for group_dn in &user.entity.member_of {
            if let Some(group) = self.store.group_by_dn(group_dn).await? {
                current_group_ids.insert(group.group.entity.object_guid.clone());
                current_groups.push(group);
            }
        }

        // Disabled is treated identically to deleted
        if user.is_disabled() {
            user.entity.is_deleted = true;
        }

        let db_user = match self.store.user_by_guid(&guid).await? {
            Some(mut db_user) => {
                debug!(login = %user.login(), "Existing user");
                if db_user.push.webserver_error == 404 {
                    ad_event!(
                        self.events,
                        EventType::Sync,
                        EventCategory::Warning,
                        "Ignoring cloud-deleted user: {}",
                        db_user.user.login()
                    )
                    .await;
                    user.entity.valid_state = db_user.user.entity.valid_state;
                    return Ok(result);
                }

                let mut changed = !db_user.user.fields_equal(user);
                if !changed {
                    let previous_group_ids = self.store.group_ids_of_user(&guid).await?;
                    if previous_group_ids != current_group_ids {
                        changed = true;
                        debug!(login = %db_user.user.login(), "User's groups were changed");
                    }
                } else {
                    debug!(login = %db_user.user.login(), "User was changed");
                    if !db_user.user.pwd_last_set.is_empty()
                        && db_user.user.pwd_last_set != user.pwd_last_set
                    {
                        user.set_password_changed_flag(true);
                        ad_event!(
                            self.events,
                            EventType::Sync,
                            EventCategory::Info,
                            "Password change detected for user: {}",
                            db_user.user.login()
                        )
                        .await;
                    }
                }

                // The locally-set bit survives until a successful push
                if db_user.user.is_password_changed() {
                    user.set_password_changed_flag(true);
                }

                db_user.user = user.clone();
                if db_user.push.is_sent_to_webserver && changed {
                    db_user.push.is_sent_to_webserver = false;
                }
                db_user.push.status = AdStatus::Present;
                if changed
                    && db_user
                        .push
                        .has_permanent_error(ScimClient::permanent_errors())
                {
                    debug!(
                        error = db_user.push.webserver_error,
                        login = %db_user.user.login(),
                        "Clearing permanent webserver error for user because AD data changed"
                    );
                    db_user.push.webserver_error = 0;
                }
                let validation = payload::validate_user(&db_user);
                db_user.user.entity.valid_state = if validation.is_ok() {
                    ValidState::Valid
                } else {
                    ValidState::Invalid
                };
                user.entity.valid_state = db_user.user.entity.valid_state;
                db_user.forest_guid = forest_guid.to_string();
                self.store.update_user(&db_user).await?;
                self.store.remove_user_from_all_groups(&guid).await?;
                result.changed = changed;
                db_user
            }
            None => {
                debug!(login = %user.login(), "New user");
                let mut db_user = DbUser::from_ad(user.clone(), forest_guid);
                db_user.push.status = AdStatus::Present;
                let validation = payload::validate_user(&db_user);
                db_user.user.entity.valid_state = if validation.is_ok() {
                    ValidState::Valid
                } else {
                    ValidState::Invalid
                };
                user.entity.valid_state = db_user.user.entity.valid_state;
                self.store.insert_user(&db_user).await?;
                result.is_new = true;
                db_user
            }
        };

        if !user.entity.is_deleted && !user.entity.valid_state.is_valid() {
            if let Err(reason) = payload::validate_user(&db_user) {
                ad_event!(
                    self.events,
                    EventType::Sync,
                    EventCategory::Error,
                    "Invalid user detected: {}, error: {reason}",
                    user.login()
                )
                .await;
            }
        }

        if self.config.sync.enable_avatars && !user.avatar.is_empty() {
            self.store
                .upsert_avatar(&DbUserAvatar {
                    user_object_guid: guid.clone(),
                    avatar: user.avatar.clone(),
                    avatar_md5: user.avatar_md5.clone(),
                })
                .await?;
        }

        for group in &current_groups {
            self.store
                .add_user_to_group(&guid, &group.group.entity.object_guid)
                .await?;
        }
        Ok(result)
    }

    // ========================================================================
    // Error reporting
    // ========================================================================

    async fn handle_ad_error(&mut self, error: &DirectoryError, domain: &str) {
        const IMPACT: &str = "Impact: authentication and directory sync no longer work. \
            Please update the directory configuration and test it before saving.";
        error!(domain = %domain, error = %error, "Cannot execute AD search");

        match error {
            DirectoryError::InvalidCredentials(detail) => {
                if !self.was_auth_error_reported {
                    self.was_auth_error_reported = true;
                    ad_event!(
                        self.events,
                        EventType::Sync,
                        EventCategory::Error,
                        "Unable to log in to Active Directory: {domain}. Reason: {} \
                         ({}, extended code {:#x}). {IMPACT}",
                        detail.message,
                        detail.symbolic,
                        detail.code
                    )
                    .await;
                }
            }
            DirectoryError::ServerUnreachable(reason) => {
                if !self.was_connection_error_reported {
                    self.was_connection_error_reported = true;
                    ad_event!(
                        self.events,
                        EventType::Sync,
                        EventCategory::Error,
                        "Unable to connect to the Active Directory: {domain}. \
                         Reason: {reason}. {IMPACT}"
                    )
                    .await;
                }
            }
            other => {
                ad_event!(
                    self.events,
                    EventType::Sync,
                    EventCategory::Error,
                    "Directory error while syncing {domain}: {other}"
                )
                .await;
            }
        }
    }
}
