//! Cloud pusher
//!
//! Drains the local backlog of unsent rows to the cloud, one request at a
//! time. Groups go before users within each round so group references are
//! resolvable when a user is created. A shared `(user_skip, group_skip)`
//! cursor steps past rows quarantined by a permanent webserver error
//! without touching them.
//!
//! Response handling follows a strict decision table:
//!
//! | Local state              | Action                  |
//! |--------------------------|-------------------------|
//! | deleted, no cloud id     | mark sent, no call      |
//! | deleted, cloud id        | DELETE                  |
//! | not deleted, no cloud id | POST (create)           |
//! | not deleted, cloud id    | PUT (update)            |
//!
//! A 409 on create resolves the conflict by fetching the server copy and
//! layering local data over it; a 404 on update quarantines the row as
//! cloud-deleted. Network-class failures (no HTTP status) pause the whole
//! push until the next sync tick.

use std::sync::{Arc, Mutex};

use adbridge_audit::{ad_event, EventLogger};
use adbridge_core::domain::entity::ValidState;
use adbridge_core::domain::event::{EventCategory, EventType};
use adbridge_core::domain::overlay::{DbGroup, DbUser};
use adbridge_core::domain::status::SyncStatusSnapshot;
use adbridge_core::ports::IStore;
use adbridge_scim::payload;
use adbridge_scim::{ScimClient, ScimResponse};
use chrono::Utc;
use tracing::{debug, error, warn};

use crate::monitor::MonitorFlags;

/// How a push round ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Nothing left to push
    Drained,
    /// A request failed without an HTTP status; resume on the next tick
    NetworkPaused,
    /// The cooperative stop flag was honored
    Cancelled,
}

#[derive(Debug, Default)]
struct PushStats {
    created_groups: i64,
    updated_groups: i64,
    deleted_groups: i64,
    failed_groups: i64,
    created_users: i64,
    updated_users: i64,
    deleted_users: i64,
    failed_users: i64,
}

impl PushStats {
    fn summarize(&self) -> String {
        let mut msg = String::new();
        if self.created_groups + self.updated_groups + self.deleted_groups + self.failed_groups > 0
        {
            msg.push_str(". GROUPS:");
            for (count, label) in [
                (self.created_groups, "created"),
                (self.updated_groups, "updated"),
                (self.deleted_groups, "deleted"),
                (self.failed_groups, "failed"),
            ] {
                if count > 0 {
                    msg.push_str(&format!(" {label}: {count}"));
                }
            }
        }
        if self.created_users + self.updated_users + self.deleted_users + self.failed_users > 0 {
            msg.push_str(". USERS:");
            for (count, label) in [
                (self.created_users, "created"),
                (self.updated_users, "updated"),
                (self.deleted_users, "deleted"),
                (self.failed_users, "failed"),
            ] {
                if count > 0 {
                    msg.push_str(&format!(" {label}: {count}"));
                }
            }
        }
        msg
    }
}

/// Pushes local user and group changes to the cloud
pub struct AdToWebPusher {
    store: Arc<dyn IStore>,
    scim: ScimClient,
    events: EventLogger,
    flags: Arc<MonitorFlags>,
    status: Arc<Mutex<SyncStatusSnapshot>>,
    subgroups_enabled: bool,
    avatars_enabled: bool,
    user_skip: i64,
    group_skip: i64,
    stats: PushStats,
    pushed_user_changes: i64,
    /// Groups deleted on the cloud this round; their local memberships are
    /// removed lazily at end of push so in-flight requests still see
    /// consistent joins
    deleted_group_guids: Vec<String>,
    network_paused: bool,
}

impl AdToWebPusher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn IStore>,
        scim: ScimClient,
        events: EventLogger,
        flags: Arc<MonitorFlags>,
        status: Arc<Mutex<SyncStatusSnapshot>>,
        subgroups_enabled: bool,
        avatars_enabled: bool,
    ) -> Self {
        Self {
            store,
            scim,
            events,
            flags,
            status,
            subgroups_enabled,
            avatars_enabled,
            user_skip: 0,
            group_skip: 0,
            stats: PushStats::default(),
            pushed_user_changes: 0,
            deleted_group_guids: Vec::new(),
            network_paused: false,
        }
    }

    /// Runs one push round to completion, cancellation or network pause
    pub async fn run(&mut self) -> anyhow::Result<PushOutcome> {
        ad_event!(
            self.events,
            EventType::WebPush,
            EventCategory::Info,
            "Push to the cloud started"
        )
        .await;

        self.user_skip = 0;
        self.group_skip = 0;
        self.stats = PushStats::default();
        self.pushed_user_changes = 0;
        self.deleted_group_guids.clear();
        self.network_paused = false;
        let start_time = Utc::now();

        // Transient errors get a fresh chance on every round
        self.store
            .clear_user_webserver_error_not_in(ScimClient::permanent_errors())
            .await?;
        self.store
            .clear_group_webserver_error_not_in(ScimClient::permanent_errors())
            .await?;

        {
            let mut status = self.status.lock().unwrap();
            status.is_web_push_in_progress = true;
            status.web_push_progress.reset();
            status.web_push_progress.text = "Cloud Sync".to_string();
        }

        let outcome = loop {
            if self.flags.should_stop() {
                ad_event!(
                    self.events,
                    EventType::WebPush,
                    EventCategory::Warning,
                    "Push cancelled"
                )
                .await;
                break PushOutcome::Cancelled;
            }
            if self.network_paused {
                break PushOutcome::NetworkPaused;
            }
            if !self.push_one().await? {
                self.remove_dangling_memberships().await?;
                debug!("Pushing finished because nothing left to push");
                break PushOutcome::Drained;
            }
        };

        {
            let mut status = self.status.lock().unwrap();
            status.is_web_push_in_progress = false;
            status.web_push_progress.reset();
            status.web_push_progress.text = "Idle".to_string();
        }

        let verb = match outcome {
            PushOutcome::Cancelled => "cancelled",
            PushOutcome::NetworkPaused => "paused due to network error",
            PushOutcome::Drained => "finished",
        };
        let elapsed_mins = (Utc::now() - start_time).num_seconds() / 60;
        ad_event!(
            self.events,
            EventType::WebPush,
            EventCategory::Info,
            "Push to cloud {verb}{}. Elapsed time: {elapsed_mins} minutes",
            self.stats.summarize()
        )
        .await;

        Ok(outcome)
    }

    /// Issues at most one request; groups take precedence over users.
    /// Returns false when there is nothing left to push.
    async fn push_one(&mut self) -> anyhow::Result<bool> {
        if self.push_one_group().await? {
            Ok(true)
        } else {
            self.push_one_user().await
        }
    }

    async fn push_one_group(&mut self) -> anyhow::Result<bool> {
        loop {
            let Some(mut group) = self.store.group_not_sent_to_webserver(self.group_skip).await?
            else {
                debug!("No group changes in local database to push to the cloud");
                return Ok(false);
            };

            // Rows carrying an error are skipped, not retried, this round
            if group.push.webserver_error != 0 && group.push.webserver_error / 100 != 2 {
                debug!(
                    name = %group.display_name(),
                    error = group.push.webserver_error,
                    skip = self.group_skip,
                    "Skipping group because of previous webserver error"
                );
                self.group_skip += 1;
                continue;
            }

            if group.group.entity.is_deleted {
                if group.push.qliq_id.is_empty() {
                    // Never reached the cloud, nothing to delete there
                    group.push.is_sent_to_webserver = true;
                    group.push.webserver_error = 0;
                    self.store.update_group(&group).await?;
                    continue;
                }
                debug!(name = %group.display_name(), qliq_id = %group.push.qliq_id, "Deleting group");
                let response = self.scim.delete_group(&group.push.qliq_id).await;
                self.on_delete_group_finished(response, &group).await?;
            } else if group.push.qliq_id.is_empty() {
                debug!(name = %group.display_name(), "Creating group");
                let body = payload::group_to_scim(&group);
                let response = self.scim.create_group(&body).await;
                self.on_create_group_finished(response, &group).await?;
            } else {
                debug!(name = %group.display_name(), qliq_id = %group.push.qliq_id, "Updating group");
                let body = payload::group_to_scim(&group);
                let response = self.scim.update_group(&group.push.qliq_id, &body).await;
                self.on_update_group_finished(response, &group, false).await?;
            }
            return Ok(true);
        }
    }

    async fn push_one_user(&mut self) -> anyhow::Result<bool> {
        loop {
            let Some(mut user) = self.store.user_not_sent_to_webserver(self.user_skip).await?
            else {
                debug!("No user changes in local database to push to the cloud");
                return Ok(false);
            };

            if user.push.webserver_error != 0 && user.push.webserver_error / 100 != 2 {
                debug!(
                    login = %user.user.login(),
                    error = user.push.webserver_error,
                    skip = self.user_skip,
                    "Skipping user because of previous webserver error"
                );
                self.user_skip += 1;
                continue;
            }

            if user.user.entity.is_deleted {
                if user.push.qliq_id.is_empty() {
                    user.push.is_sent_to_webserver = true;
                    user.push.webserver_error = 0;
                    self.store.update_user(&user).await?;
                    continue;
                }
                debug!(login = %user.user.login(), qliq_id = %user.push.qliq_id, "Deleting user");
                let response = self.scim.delete_user(&user.push.qliq_id).await;
                self.on_delete_user_finished(response, &user).await?;
            } else {
                user.groups = self
                    .store
                    .groups_of_user(&user.user.entity.object_guid)
                    .await?;
                let avatar = if self.avatars_enabled {
                    self.store
                        .avatar_of_user(&user.user.entity.object_guid)
                        .await?
                } else {
                    None
                };
                let body = payload::user_to_scim(&user, self.subgroups_enabled);

                if user.push.qliq_id.is_empty() {
                    debug!(login = %user.user.login(), "Creating user");
                    let response = self.scim.create_user(&body, avatar).await;
                    self.on_create_user_finished(response, &user).await?;
                } else {
                    debug!(login = %user.user.login(), qliq_id = %user.push.qliq_id, "Updating user");
                    let response = self
                        .scim
                        .update_user(&user.push.qliq_id, &body, avatar)
                        .await;
                    self.on_update_user_finished(response, &user, false).await?;
                }
            }
            return Ok(true);
        }
    }

    // ========================================================================
    // Group response handling
    // ========================================================================

    async fn on_create_group_finished(
        &mut self,
        response: ScimResponse,
        ctx: &DbGroup,
    ) -> anyhow::Result<()> {
        if response.is_network_error() {
            self.stats.failed_groups += 1;
            self.pause_for_network(&response).await;
            return Ok(());
        }
        let guid = &ctx.group.entity.object_guid;
        let Some(mut group) = self.store.group_by_guid(guid).await? else {
            error!(guid = %guid, "Got web response for create group but cannot find the group");
            return Ok(());
        };

        match response.status.unwrap_or(0) {
            201 => match response.cloud_id() {
                Some(qliq_id) => {
                    group.push.qliq_id = qliq_id.clone();
                    group.push.is_sent_to_webserver = true;
                    group.push.webserver_error = 0;
                    self.store.update_group(&group).await?;
                    self.stats.created_groups += 1;
                    debug!(qliq_id = %qliq_id, name = %group.display_name(), "Created group on the cloud");
                }
                None => {
                    self.stats.failed_groups += 1;
                    ad_event!(
                        self.events,
                        EventType::WebPush,
                        EventCategory::Error,
                        "Cannot read cloud id ('id' field) from server (create group): {}",
                        response.body
                    )
                    .await;
                }
            },
            409 => {
                self.resolve_group_conflict(&response, &group).await?;
            }
            code @ (400 | 422) => {
                ad_event!(
                    self.events,
                    EventType::WebPush,
                    EventCategory::Error,
                    "Create group webservice call returned code {code}. Marking the group as \
                     invalid, objectGuid: {guid}, name: {}",
                    group.display_name()
                )
                .await;
                group.group.entity.valid_state = ValidState::Rejected(code);
                group.push.webserver_error = code;
                self.store.update_group(&group).await?;
                self.stats.failed_groups += 1;
            }
            code => {
                self.stats.failed_groups += 1;
                self.record_group_error(&mut group, code).await?;
            }
        }
        Ok(())
    }

    /// 409 on create: the cloud already has this group. Fetch the server
    /// copy, layer our fields over it, and update in place.
    async fn resolve_group_conflict(
        &mut self,
        conflict: &ScimResponse,
        group: &DbGroup,
    ) -> anyhow::Result<()> {
        let Some(existing_id) = conflict.cloud_id() else {
            self.stats.failed_groups += 1;
            ad_event!(
                self.events,
                EventType::WebPush,
                EventCategory::Error,
                "Create group returned conflict without an id, name: {}",
                group.display_name()
            )
            .await;
            return Ok(());
        };
        warn!(
            guid = %group.group.entity.object_guid,
            qliq_id = %existing_id,
            "Create group returned conflict, trying to GET and UPDATE the group now"
        );

        let fetched = self.scim.get_group(&existing_id).await;
        if fetched.is_network_error() {
            self.stats.failed_groups += 1;
            self.pause_for_network(&fetched).await;
            return Ok(());
        }
        match (fetched.status.unwrap_or(0), fetched.json()) {
            (200, Some(server_copy)) => {
                let merged = payload::merge_group_over_server(server_copy, group);
                let put = self.scim.update_group(&existing_id, &merged).await;
                self.on_update_group_finished(put, group, true).await?;
            }
            (code, _) => {
                self.stats.failed_groups += 1;
                if let Some(mut db) = self
                    .store
                    .group_by_guid(&group.group.entity.object_guid)
                    .await?
                {
                    self.record_group_error(&mut db, code).await?;
                }
            }
        }
        Ok(())
    }

    async fn on_update_group_finished(
        &mut self,
        response: ScimResponse,
        ctx: &DbGroup,
        _is_resolving_conflict: bool,
    ) -> anyhow::Result<()> {
        if response.is_network_error() {
            self.stats.failed_groups += 1;
            self.pause_for_network(&response).await;
            return Ok(());
        }
        let guid = &ctx.group.entity.object_guid;
        let Some(mut group) = self.store.group_by_guid(guid).await? else {
            error!(guid = %guid, "Got web response for update group but cannot find the group");
            return Ok(());
        };

        match response.status.unwrap_or(0) {
            200 => match response.cloud_id() {
                Some(qliq_id) => {
                    group.push.qliq_id = qliq_id.clone();
                    group.push.is_sent_to_webserver = true;
                    group.push.webserver_error = 0;
                    self.store.update_group(&group).await?;
                    self.stats.updated_groups += 1;
                    debug!(qliq_id = %qliq_id, name = %group.display_name(), "Updated group on the cloud");
                }
                None => {
                    self.stats.failed_groups += 1;
                    ad_event!(
                        self.events,
                        EventType::WebPush,
                        EventCategory::Error,
                        "Cannot read cloud id ('id' field) from server (update group): {}",
                        response.body
                    )
                    .await;
                }
            },
            404 => {
                ad_event!(
                    self.events,
                    EventType::WebPush,
                    EventCategory::Warning,
                    "Update group webservice call returned 404. Marking the group as \
                     cloud-deleted and ignored now, name: {}",
                    group.display_name()
                )
                .await;
                group.push.qliq_id.clear();
                group.group.entity.is_deleted = true;
                group.push.is_sent_to_webserver = true;
                group.push.webserver_error = 404;
                self.store.update_group(&group).await?;
                self.stats.deleted_groups += 1;
            }
            code @ (400 | 422) => {
                ad_event!(
                    self.events,
                    EventType::WebPush,
                    EventCategory::Error,
                    "Update group webservice call returned code {code}. Marking the group as \
                     invalid, objectGuid: {guid}, name: {}",
                    group.display_name()
                )
                .await;
                group.group.entity.valid_state = ValidState::Rejected(code);
                group.push.webserver_error = code;
                self.store.update_group(&group).await?;
                self.stats.failed_groups += 1;
            }
            code => {
                self.stats.failed_groups += 1;
                self.record_group_error(&mut group, code).await?;
            }
        }
        Ok(())
    }

    async fn on_delete_group_finished(
        &mut self,
        response: ScimResponse,
        ctx: &DbGroup,
    ) -> anyhow::Result<()> {
        if response.is_network_error() {
            self.stats.failed_groups += 1;
            self.pause_for_network(&response).await;
            return Ok(());
        }
        let guid = ctx.group.entity.object_guid.clone();
        match response.status.unwrap_or(0) {
            200 => {
                debug!(name = %ctx.display_name(), "Deleted group on the cloud");
                self.store.delete_group(&guid).await?;
                self.store.delete_forest_group_membership(&guid).await?;
                self.deleted_group_guids.push(guid);
                self.stats.deleted_groups += 1;
            }
            404 => {
                debug!(name = %ctx.display_name(), "Group already doesn't exist on the cloud");
                self.store.delete_group(&guid).await?;
                self.store.delete_forest_group_membership(&guid).await?;
                self.deleted_group_guids.push(guid);
            }
            code => {
                error!(code, name = %ctx.display_name(), "Cannot delete group on the cloud");
                self.stats.failed_groups += 1;
                if let Some(mut db) = self.store.group_by_guid(&guid).await? {
                    self.record_group_error(&mut db, code).await?;
                }
            }
        }
        Ok(())
    }

    async fn record_group_error(&mut self, group: &mut DbGroup, code: u16) -> anyhow::Result<()> {
        if code >= 300 {
            ad_event!(
                self.events,
                EventType::WebPush,
                EventCategory::Error,
                "Cloud returned error for group: {} error: {code}",
                group.display_name()
            )
            .await;
            group.push.webserver_error = code;
            self.store.update_group(group).await?;
        }
        Ok(())
    }

    // ========================================================================
    // User response handling
    // ========================================================================

    async fn on_create_user_finished(
        &mut self,
        response: ScimResponse,
        ctx: &DbUser,
    ) -> anyhow::Result<()> {
        if response.is_network_error() {
            self.stats.failed_users += 1;
            self.pause_for_network(&response).await;
            return Ok(());
        }
        let guid = &ctx.user.entity.object_guid;
        let Some(mut user) = self.store.user_by_guid(guid).await? else {
            error!(guid = %guid, "Got web response for create user but cannot find the user");
            return Ok(());
        };

        match response.status.unwrap_or(0) {
            201 => match response.cloud_id() {
                Some(qliq_id) => {
                    user.push.qliq_id = qliq_id.clone();
                    user.push.is_sent_to_webserver = true;
                    user.push.webserver_error = 0;
                    user.user.set_password_changed_flag(false);
                    self.store.update_user(&user).await?;
                    self.stats.created_users += 1;
                    debug!(qliq_id = %qliq_id, login = %user.user.login(), "Created user on the cloud");
                    self.increment_pushed_user_changes().await?;
                }
                None => {
                    self.stats.failed_users += 1;
                    ad_event!(
                        self.events,
                        EventType::WebPush,
                        EventCategory::Error,
                        "Cannot read cloud id ('id' field) from server (create user): {}",
                        response.body
                    )
                    .await;
                }
            },
            409 => {
                self.resolve_user_conflict(&response, ctx).await?;
            }
            code @ (400 | 422) => {
                ad_event!(
                    self.events,
                    EventType::WebPush,
                    EventCategory::Error,
                    "Create user webservice call returned 'bad request' code: {code}. Marking \
                     the user as invalid, objectGuid: {guid}, login: {}, first name: {}, last \
                     name: {}",
                    user.user.login(),
                    user.user.first_name(),
                    user.user.last_name()
                )
                .await;
                user.user.entity.valid_state = ValidState::Rejected(code);
                user.push.webserver_error = code;
                self.store.update_user(&user).await?;
                self.stats.failed_users += 1;
            }
            code => {
                self.stats.failed_users += 1;
                self.record_user_error(&mut user, code).await?;
            }
        }
        Ok(())
    }

    async fn resolve_user_conflict(
        &mut self,
        conflict: &ScimResponse,
        ctx: &DbUser,
    ) -> anyhow::Result<()> {
        let Some(existing_id) = conflict.cloud_id() else {
            self.stats.failed_users += 1;
            ad_event!(
                self.events,
                EventType::WebPush,
                EventCategory::Error,
                "Create user returned conflict without an id, login: {}",
                ctx.user.login()
            )
            .await;
            return Ok(());
        };
        warn!(
            guid = %ctx.user.entity.object_guid,
            login = %ctx.user.login(),
            qliq_id = %existing_id,
            "Create user returned conflict, trying to GET and UPDATE the user now"
        );

        let fetched = self.scim.get_user(&existing_id).await;
        if fetched.is_network_error() {
            self.stats.failed_users += 1;
            self.pause_for_network(&fetched).await;
            return Ok(());
        }
        match (fetched.status.unwrap_or(0), fetched.json()) {
            (200, Some(server_copy)) => {
                // ctx still carries the groups loaded for the original POST
                let merged = payload::merge_user_over_server(server_copy, ctx, self.subgroups_enabled);
                let put = self.scim.update_user(&existing_id, &merged, None).await;
                self.on_update_user_finished(put, ctx, true).await?;
            }
            (code, _) => {
                self.stats.failed_users += 1;
                if let Some(mut db) = self.store.user_by_guid(&ctx.user.entity.object_guid).await? {
                    self.record_user_error(&mut db, code).await?;
                }
            }
        }
        Ok(())
    }

    async fn on_update_user_finished(
        &mut self,
        response: ScimResponse,
        ctx: &DbUser,
        _is_resolving_conflict: bool,
    ) -> anyhow::Result<()> {
        if response.is_network_error() {
            self.stats.failed_users += 1;
            self.pause_for_network(&response).await;
            return Ok(());
        }
        let guid = &ctx.user.entity.object_guid;
        let Some(mut user) = self.store.user_by_guid(guid).await? else {
            error!(guid = %guid, "Got web response for update user but cannot find the user");
            return Ok(());
        };

        match response.status.unwrap_or(0) {
            200 => match response.cloud_id() {
                Some(qliq_id) => {
                    user.push.qliq_id = qliq_id.clone();
                    user.push.is_sent_to_webserver = true;
                    user.push.webserver_error = 0;
                    user.user.set_password_changed_flag(false);
                    self.store.update_user(&user).await?;
                    self.stats.updated_users += 1;
                    debug!(qliq_id = %qliq_id, login = %user.user.login(), "Updated user on the cloud");
                    self.increment_pushed_user_changes().await?;
                }
                None => {
                    self.stats.failed_users += 1;
                    ad_event!(
                        self.events,
                        EventType::WebPush,
                        EventCategory::Error,
                        "Cannot read cloud id ('id' field) from server (update user): {}",
                        response.body
                    )
                    .await;
                }
            },
            404 => {
                ad_event!(
                    self.events,
                    EventType::WebPush,
                    EventCategory::Warning,
                    "Update user webservice call returned 404. Marking the user as \
                     cloud-deleted and ignored now, login: {}",
                    user.user.login()
                )
                .await;
                user.push.qliq_id.clear();
                user.user.entity.is_deleted = true;
                user.push.is_sent_to_webserver = true;
                user.push.webserver_error = 404;
                user.user.set_password_changed_flag(false);
                self.store.update_user(&user).await?;
                self.stats.deleted_users += 1;
                self.increment_pushed_user_changes().await?;
            }
            code @ (400 | 422) => {
                ad_event!(
                    self.events,
                    EventType::WebPush,
                    EventCategory::Error,
                    "Update user webservice call returned code {code}. Marking the user as \
                     invalid, objectGuid: {guid}, login: {}",
                    user.user.login()
                )
                .await;
                user.user.entity.valid_state = ValidState::Rejected(code);
                user.push.webserver_error = code;
                self.store.update_user(&user).await?;
                self.stats.failed_users += 1;
            }
            code => {
                self.stats.failed_users += 1;
                self.record_user_error(&mut user, code).await?;
            }
        }
        Ok(())
    }

    async fn on_delete_user_finished(
        &mut self,
        response: ScimResponse,
        ctx: &DbUser,
    ) -> anyhow::Result<()> {
        if response.is_network_error() {
            self.stats.failed_users += 1;
            self.pause_for_network(&response).await;
            return Ok(());
        }
        let guid = ctx.user.entity.object_guid.clone();
        match response.status.unwrap_or(0) {
            200 => {
                debug!(login = %ctx.user.login(), "Deleted user on the cloud");
                self.store.delete_user(&guid).await?;
                self.store.remove_user_from_all_groups(&guid).await?;
                self.stats.deleted_users += 1;
                self.increment_pushed_user_changes().await?;
            }
            404 => {
                debug!(login = %ctx.user.login(), "User already doesn't exist on the cloud");
                self.store.delete_user(&guid).await?;
                self.store.remove_user_from_all_groups(&guid).await?;
            }
            code => {
                error!(code, login = %ctx.user.login(), "Cannot delete user on the cloud");
                self.stats.failed_users += 1;
                if let Some(mut db) = self.store.user_by_guid(&guid).await? {
                    self.record_user_error(&mut db, code).await?;
                }
            }
        }
        Ok(())
    }

    async fn record_user_error(&mut self, user: &mut DbUser, code: u16) -> anyhow::Result<()> {
        if code >= 300 {
            ad_event!(
                self.events,
                EventType::WebPush,
                EventCategory::Error,
                "Cloud returned error for user: {} error: {code}",
                user.user.login()
            )
            .await;
            user.push.webserver_error = code;
            self.store.update_user(user).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Shared plumbing
    // ========================================================================

    async fn pause_for_network(&mut self, response: &ScimResponse) {
        ad_event!(
            self.events,
            EventType::WebPush,
            EventCategory::Error,
            "Interrupting pushing because of network error: {}",
            response.body
        )
        .await;
        self.network_paused = true;
    }

    /// Drops membership rows of groups deleted on the cloud this round.
    /// Deferred so in-flight user payloads still see consistent joins.
    async fn remove_dangling_memberships(&mut self) -> anyhow::Result<()> {
        for guid in std::mem::take(&mut self.deleted_group_guids) {
            self.store.remove_all_users_from_group(&guid).await?;
        }
        Ok(())
    }

    async fn increment_pushed_user_changes(&mut self) -> anyhow::Result<()> {
        self.pushed_user_changes += 1;
        let publish = {
            let mut status = self.status.lock().unwrap();
            status.web_push_progress.value += 1;
            status.web_push_progress.text =
                format!("Cloud Sync {} users", self.pushed_user_changes);
            self.pushed_user_changes == 1
                || self.pushed_user_changes % 100 == 0
                || status.web_push_progress.value > status.web_push_progress.maximum
        };

        if publish {
            let remaining = (self.store.count_users_not_sent_to_webserver().await?
                - self.user_skip)
                .max(0);
            ad_event!(
                self.events,
                EventType::WebPush,
                EventCategory::Info,
                "Pushed {} user changes to the cloud, {remaining} more to go",
                self.pushed_user_changes
            )
            .await;
            let mut status = self.status.lock().unwrap();
            status.web_push_progress.maximum = remaining as i32;
            status.web_push_progress.value = 0;
        }
        Ok(())
    }
}
