//! Local store port (driven/secondary port)
//!
//! The relational surface the engine persists through. The store
//! exclusively owns all persisted rows; every other component works on
//! transient copies obtained here.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific and
//!   don't need domain-level classification.
//! - Object GUIDs are passed as `&str`: directory-sourced identifiers are
//!   kept in their raw textual form end to end.
//! - `apply_forest_changes` must execute the whole edit script inside one
//!   transaction; partial failure rolls back the entire apply.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::domain::changes::ForestWithChange;
use crate::domain::event::Event;
use crate::domain::forest::Forest;
use crate::domain::overlay::{AdStatus, DbGroup, DbUser, DbUserAvatar};
use crate::domain::sync_context::SyncContext;

/// Port trait for persistent state storage
#[async_trait]
pub trait IStore: Send + Sync {
    // --- Forest configuration ---

    /// Hydrates all forests with their domain controllers, primary first
    async fn load_forests(&self) -> anyhow::Result<Vec<Forest>>;

    /// Applies a comparator-derived edit script in a single transaction
    /// labelled "update AD forests"
    async fn apply_forest_changes(&self, changes: &[ForestWithChange]) -> anyhow::Result<()>;

    /// Persists the lazily-resolved DNS name of a controller
    async fn update_controller_dns_name(
        &self,
        forest_guid: &str,
        host: &str,
        dns_name: &str,
    ) -> anyhow::Result<()>;

    /// Wipes all synced state in one transaction: forests, controller and
    /// group memberships, sync contexts, users, groups, user-group
    /// memberships, avatars and the event log.
    async fn reset_sync_database(&self) -> anyhow::Result<()>;

    // --- Sync contexts ---

    async fn sync_context(&self, forest_guid: &str, dc_host: &str)
        -> anyhow::Result<Option<SyncContext>>;
    async fn upsert_sync_context(&self, ctx: &SyncContext) -> anyhow::Result<()>;
    /// Clears every context's last-full-sync timestamp, forcing the next
    /// run to be full for every forest
    async fn clear_all_last_full_sync(&self) -> anyhow::Result<()>;

    // --- Users ---

    async fn user_by_guid(&self, guid: &str) -> anyhow::Result<Option<DbUser>>;
    async fn user_exists(&self, guid: &str) -> anyhow::Result<bool>;
    async fn insert_user(&self, user: &DbUser) -> anyhow::Result<()>;
    async fn update_user(&self, user: &DbUser) -> anyhow::Result<()>;
    async fn delete_user(&self, guid: &str) -> anyhow::Result<()>;
    /// Marks the given users deleted; returns the number of rows affected
    async fn mark_users_deleted(&self, guids: &[String]) -> anyhow::Result<u64>;
    async fn set_status_for_present_users_of_forest(
        &self,
        status: AdStatus,
        forest_guid: &str,
    ) -> anyhow::Result<()>;
    /// Bulk status flip for all users of one forest, guarded by the
    /// current status
    async fn set_status_for_users_of_forest(
        &self,
        new_status: AdStatus,
        if_old_status: AdStatus,
        forest_guid: &str,
    ) -> anyhow::Result<()>;
    /// Bulk status flip for the members of one group, guarded by the
    /// current status
    async fn set_status_for_members_of_group(
        &self,
        new_status: AdStatus,
        if_old_status: AdStatus,
        group_guid: &str,
    ) -> anyhow::Result<()>;
    async fn count_users_with_status_of_forest(
        &self,
        status: AdStatus,
        forest_guid: &str,
    ) -> anyhow::Result<i64>;
    /// Count of users in `status` that have not been sent to the cloud;
    /// the anomaly detector's "newly missing" recount
    async fn count_users_with_status_not_sent(&self, status: AdStatus) -> anyhow::Result<i64>;
    /// Rows absent from the directory: status Unknown (this cycle's
    /// residue) or NotPresent (unpushed backlog from earlier cycles)
    async fn users_not_present_of_forest(
        &self,
        forest_guid: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<DbUser>>;
    /// Marks deleted every user of the forest still carrying `status`;
    /// returns the number of rows affected
    async fn mark_users_deleted_with_status_of_forest(
        &self,
        forest_guid: &str,
        status: AdStatus,
    ) -> anyhow::Result<u64>;
    /// Clears webserver errors that are not in the permanent set
    async fn clear_user_webserver_error_not_in(&self, permanent: &[u16]) -> anyhow::Result<()>;
    /// The push cursor: the next unsent user after skipping `skip` rows
    async fn user_not_sent_to_webserver(&self, skip: i64) -> anyhow::Result<Option<DbUser>>;
    async fn count_users_not_sent_to_webserver(&self) -> anyhow::Result<i64>;

    // --- Avatars ---

    async fn upsert_avatar(&self, avatar: &DbUserAvatar) -> anyhow::Result<()>;
    async fn avatar_of_user(&self, guid: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn delete_all_avatars(&self) -> anyhow::Result<()>;

    // --- Groups ---

    async fn group_by_guid(&self, guid: &str) -> anyhow::Result<Option<DbGroup>>;
    async fn group_by_dn(&self, distinguished_name: &str) -> anyhow::Result<Option<DbGroup>>;
    async fn group_exists(&self, guid: &str) -> anyhow::Result<bool>;
    async fn insert_group(&self, group: &DbGroup) -> anyhow::Result<()>;
    async fn update_group(&self, group: &DbGroup) -> anyhow::Result<()>;
    async fn delete_group(&self, guid: &str) -> anyhow::Result<()>;
    async fn set_status_for_groups_of_forest(
        &self,
        status: AdStatus,
        forest_guid: &str,
    ) -> anyhow::Result<()>;
    async fn count_groups_with_status_of_forest(
        &self,
        status: AdStatus,
        forest_guid: &str,
    ) -> anyhow::Result<i64>;
    async fn groups_not_present_of_forest(
        &self,
        forest_guid: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<DbGroup>>;
    async fn mark_groups_deleted_with_status_of_forest(
        &self,
        forest_guid: &str,
        status: AdStatus,
    ) -> anyhow::Result<u64>;
    /// Removes the main-group rows of a forest (forest deletion)
    async fn delete_main_groups_of_forest(&self, forest_guid: &str) -> anyhow::Result<u64>;
    /// Removes main-group ghosts left behind after enumeration
    async fn delete_main_groups_not_present_of_forest(
        &self,
        forest_guid: &str,
    ) -> anyhow::Result<u64>;
    /// Subgroups were disabled: marks deleted-and-unsent every non-main
    /// group that already exists on the cloud; returns rows affected
    async fn mark_deleted_unsent_groups_with_cloud_id(&self) -> anyhow::Result<u64>;
    /// Records a group's `uSNChanged` after its members were enumerated
    async fn update_group_usn_changed(&self, group_guid: &str, usn: &str) -> anyhow::Result<()>;
    async fn clear_group_webserver_error_not_in(&self, permanent: &[u16]) -> anyhow::Result<()>;
    async fn group_not_sent_to_webserver(&self, skip: i64) -> anyhow::Result<Option<DbGroup>>;

    // --- Memberships ---

    async fn add_user_to_group(&self, user_guid: &str, group_guid: &str) -> anyhow::Result<()>;
    async fn remove_user_from_all_groups(&self, user_guid: &str) -> anyhow::Result<()>;
    /// Drops every membership row of the group (cloud-side group deletion
    /// cleanup)
    async fn remove_all_users_from_group(&self, group_guid: &str) -> anyhow::Result<()>;
    /// Drops membership rows of the group whose user is no longer Present;
    /// called after a group's members were re-enumerated
    async fn remove_stale_members_of_group(&self, group_guid: &str) -> anyhow::Result<u64>;
    async fn groups_of_user(&self, user_guid: &str) -> anyhow::Result<Vec<DbGroup>>;
    async fn group_ids_of_user(&self, user_guid: &str) -> anyhow::Result<HashSet<String>>;
    async fn save_forest_group_membership(
        &self,
        forest_guid: &str,
        group_guid: &str,
    ) -> anyhow::Result<()>;
    async fn delete_forest_group_membership(&self, group_guid: &str) -> anyhow::Result<()>;

    // --- Events ---

    async fn insert_event(&self, event: &Event) -> anyhow::Result<()>;
    /// Newest first
    async fn events_page(&self, offset: i64, count: i64) -> anyhow::Result<Vec<Event>>;
    async fn delete_all_events(&self) -> anyhow::Result<()>;
    async fn delete_events_older_than_days(&self, days: i64) -> anyhow::Result<u64>;
}
