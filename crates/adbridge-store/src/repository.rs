//! SQLite implementation of IStore
//!
//! All domain↔SQL conversion and query construction lives here. The
//! forest-configuration apply is the only multi-statement write: it runs
//! inside one transaction ("update AD forests") so a failing edit script
//! rolls back completely and the previous configuration stays intact.
//!
//! ## Type Mapping
//!
//! | Domain Type      | SQL Type | Strategy                               |
//! |------------------|----------|----------------------------------------|
//! | ObjectGuid       | TEXT     | raw GUID string                        |
//! | Vec<String>      | TEXT     | serde_json array                       |
//! | DateTime<Utc>    | TEXT     | ISO 8601 via `to_rfc3339()`            |
//! | AdStatus         | INTEGER  | stable codes via `to_code()`           |
//! | ValidState       | INTEGER  | 0 invalid, 1 valid, HTTP code rejected |
//! | bool             | INTEGER  | 0/1                                    |

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use adbridge_core::domain::changes::{
    DomainControllerChange, ForestChanges, ForestWithChange,
};
use adbridge_core::domain::entity::{AdGroup, AdUser, ValidState};
use adbridge_core::domain::event::{Event, EventCategory, EventType};
use adbridge_core::domain::forest::{DomainController, Forest};
use adbridge_core::domain::newtypes::ObjectGuid;
use adbridge_core::domain::overlay::{AdStatus, DbGroup, DbUser, DbUserAvatar, PushState};
use adbridge_core::domain::sync_context::SyncContext;
use adbridge_core::ports::IStore;

use crate::StoreError;

/// SQLite-based implementation of the store port
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Creates a new store instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

fn vec_to_json(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn vec_from_json(text: &str) -> Vec<String> {
    serde_json::from_str(text).unwrap_or_default()
}

fn parse_optional_datetime(text: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    match text {
        Some(ref value) if !value.is_empty() => DateTime::parse_from_rfc3339(value)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| {
                StoreError::Serialization(format!("Failed to parse datetime '{}': {}", value, e))
            }),
        _ => Ok(None),
    }
}

fn parse_datetime(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            StoreError::Serialization(format!("Failed to parse datetime '{}': {}", text, e))
        })
}

/// Builds a `NOT IN (...)` placeholder list for a dynamic value set
fn placeholders(count: usize) -> String {
    let mut list = String::new();
    for i in 0..count {
        if i > 0 {
            list.push_str(", ");
        }
        list.push('?');
    }
    list
}

// ============================================================================
// Row mapping functions
// ============================================================================

fn user_from_row(row: &SqliteRow) -> Result<DbUser, StoreError> {
    let mut user = AdUser {
        user_principal_name: row.get("user_principal_name"),
        given_name: row.get("given_name"),
        middle_name: row.get("middle_name"),
        sn: row.get("sn"),
        display_name: row.get("display_name"),
        mail: row.get("mail"),
        telephone_number: row.get("telephone_number"),
        mobile: row.get("mobile"),
        title: row.get("title"),
        employee_number: row.get("employee_number"),
        organization: row.get("organization"),
        division: row.get("division"),
        department: row.get("department"),
        user_account_control: row.get::<i64, _>("user_account_control") as u32,
        user_account_control_computed: row.get::<i64, _>("user_account_control_computed") as u32,
        avatar_md5: row.get("avatar_md5"),
        pwd_last_set: row.get("pwd_last_set"),
        ..AdUser::default()
    };
    user.entity.object_guid = row.get("object_guid");
    user.entity.distinguished_name = row.get("distinguished_name");
    user.entity.cn = row.get("cn");
    user.entity.account_name = row.get("account_name");
    user.entity.object_classes = vec_from_json(&row.get::<String, _>("object_classes"));
    user.entity.member_of = vec_from_json(&row.get::<String, _>("member_of"));
    user.entity.usn_changed = row.get("usn_changed");
    user.entity.is_deleted = row.get::<i64, _>("is_deleted") != 0;
    user.entity.valid_state = ValidState::from_code(row.get::<i64, _>("valid_state") as u16);

    Ok(DbUser {
        user,
        push: PushState {
            qliq_id: row.get("qliq_id"),
            is_sent_to_webserver: row.get::<i64, _>("is_sent_to_webserver") != 0,
            webserver_error: row.get::<i64, _>("webserver_error") as u16,
            status: AdStatus::from_code(row.get("ad_status")),
        },
        forest_guid: row.get("forest_guid"),
        groups: Vec::new(),
    })
}

fn group_from_row(row: &SqliteRow) -> Result<DbGroup, StoreError> {
    let mut group = AdGroup {
        members: vec_from_json(&row.get::<String, _>("members")),
        ..AdGroup::default()
    };
    group.entity.object_guid = row.get("object_guid");
    group.entity.distinguished_name = row.get("distinguished_name");
    group.entity.cn = row.get("cn");
    group.entity.account_name = row.get("account_name");
    group.entity.object_classes = vec_from_json(&row.get::<String, _>("object_classes"));
    group.entity.member_of = vec_from_json(&row.get::<String, _>("member_of"));
    group.entity.usn_changed = row.get("usn_changed");
    group.entity.is_deleted = row.get::<i64, _>("is_deleted") != 0;
    group.entity.valid_state = ValidState::from_code(row.get::<i64, _>("valid_state") as u16);

    Ok(DbGroup {
        group,
        push: PushState {
            qliq_id: row.get("qliq_id"),
            is_sent_to_webserver: row.get::<i64, _>("is_sent_to_webserver") != 0,
            webserver_error: row.get::<i64, _>("webserver_error") as u16,
            status: AdStatus::from_code(row.get("ad_status")),
        },
        forest_guid: row.get("forest_guid"),
        is_main_group: row.get::<i64, _>("is_main_group") != 0,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<Event, StoreError> {
    let type_str: String = row.get("type");
    let category_str: String = row.get("category");
    Ok(Event {
        id: row.get("id"),
        timestamp: parse_datetime(&row.get::<String, _>("timestamp"))?,
        event_type: EventType::from_str_loose(&type_str).ok_or_else(|| {
            StoreError::Serialization(format!("Unknown event type: {type_str}"))
        })?,
        category: EventCategory::from_str_loose(&category_str).ok_or_else(|| {
            StoreError::Serialization(format!("Unknown event category: {category_str}"))
        })?,
        message: row.get("message"),
    })
}

const USER_UPSERT_SQL: &str = "\
    (object_guid, forest_guid, distinguished_name, cn, account_name, object_classes, \
     member_of, usn_changed, is_deleted, valid_state, user_principal_name, given_name, \
     middle_name, sn, display_name, mail, telephone_number, mobile, title, \
     employee_number, organization, division, department, user_account_control, \
     user_account_control_computed, avatar_md5, pwd_last_set, qliq_id, \
     is_sent_to_webserver, webserver_error, ad_status) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

fn bind_user_values<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    user: &'q DbUser,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(&user.user.entity.object_guid)
        .bind(&user.forest_guid)
        .bind(&user.user.entity.distinguished_name)
        .bind(&user.user.entity.cn)
        .bind(&user.user.entity.account_name)
        .bind(vec_to_json(&user.user.entity.object_classes))
        .bind(vec_to_json(&user.user.entity.member_of))
        .bind(&user.user.entity.usn_changed)
        .bind(user.user.entity.is_deleted as i64)
        .bind(user.user.entity.valid_state.to_code() as i64)
        .bind(&user.user.user_principal_name)
        .bind(&user.user.given_name)
        .bind(&user.user.middle_name)
        .bind(&user.user.sn)
        .bind(&user.user.display_name)
        .bind(&user.user.mail)
        .bind(&user.user.telephone_number)
        .bind(&user.user.mobile)
        .bind(&user.user.title)
        .bind(&user.user.employee_number)
        .bind(&user.user.organization)
        .bind(&user.user.division)
        .bind(&user.user.department)
        .bind(user.user.user_account_control as i64)
        .bind(user.user.user_account_control_computed as i64)
        .bind(&user.user.avatar_md5)
        .bind(&user.user.pwd_last_set)
        .bind(&user.push.qliq_id)
        .bind(user.push.is_sent_to_webserver as i64)
        .bind(user.push.webserver_error as i64)
        .bind(user.push.status.to_code())
}

const GROUP_UPSERT_SQL: &str = "\
    (object_guid, forest_guid, distinguished_name, cn, account_name, object_classes, \
     member_of, members, usn_changed, is_deleted, valid_state, is_main_group, qliq_id, \
     is_sent_to_webserver, webserver_error, ad_status) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

fn bind_group_values<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    group: &'q DbGroup,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(&group.group.entity.object_guid)
        .bind(&group.forest_guid)
        .bind(&group.group.entity.distinguished_name)
        .bind(&group.group.entity.cn)
        .bind(&group.group.entity.account_name)
        .bind(vec_to_json(&group.group.entity.object_classes))
        .bind(vec_to_json(&group.group.entity.member_of))
        .bind(vec_to_json(&group.group.members))
        .bind(&group.group.entity.usn_changed)
        .bind(group.group.entity.is_deleted as i64)
        .bind(group.group.entity.valid_state.to_code() as i64)
        .bind(group.is_main_group as i64)
        .bind(&group.push.qliq_id)
        .bind(group.push.is_sent_to_webserver as i64)
        .bind(group.push.webserver_error as i64)
        .bind(group.push.status.to_code())
}

// ============================================================================
// IStore implementation
// ============================================================================

#[async_trait]
impl IStore for SqliteStore {
    // --- Forest configuration ---

    async fn load_forests(&self) -> anyhow::Result<Vec<Forest>> {
        let forest_rows = sqlx::query(
            "SELECT object_guid, user_name, password, sync_group FROM active_directory_forest",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut forests = Vec::with_capacity(forest_rows.len());
        for row in forest_rows {
            let guid: String = row.get("object_guid");
            let dc_rows = sqlx::query(
                "SELECT host, dns_name, is_primary FROM active_directory_forest_dc_membership \
                 WHERE forest_guid = ? ORDER BY is_primary DESC, rowid ASC",
            )
            .bind(&guid)
            .fetch_all(&self.pool)
            .await?;

            let controllers = dc_rows
                .iter()
                .map(|dc| DomainController {
                    host: dc.get("host"),
                    dns_name: dc.get("dns_name"),
                    is_primary: dc.get::<i64, _>("is_primary") != 0,
                })
                .filter(|dc| !dc.host.trim().is_empty())
                .collect();

            forests.push(Forest {
                object_guid: ObjectGuid::new(guid)?,
                user_name: row.get("user_name"),
                password: row.get("password"),
                sync_group: row.get("sync_group"),
                domain_controllers: controllers,
            });
        }
        Ok(forests)
    }

    async fn apply_forest_changes(&self, changes: &[ForestWithChange]) -> anyhow::Result<()> {
        tracing::debug!(count = changes.len(), "Starting transaction: update AD forests");
        let mut tx = self.pool.begin().await?;

        for fc in changes {
            let forest_guid = fc.forest.object_guid.as_str();
            tracing::debug!(forest = forest_guid, changes = %fc.changes, "Processing forest changes");

            if fc.changes.contains(ForestChanges::ADDED) {
                sqlx::query(
                    "INSERT INTO active_directory_forest (object_guid, user_name, password, sync_group) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(forest_guid)
                .bind(&fc.forest.user_name)
                .bind(&fc.forest.password)
                .bind(&fc.forest.sync_group)
                .execute(&mut *tx)
                .await?;
                // Domain controllers are added in the per-controller loop below
            } else if fc.changes.contains(ForestChanges::DELETED) {
                sqlx::query(
                    "UPDATE active_directory_user SET is_deleted = 1, is_sent_to_webserver = 0 \
                     WHERE forest_guid = ?",
                )
                .bind(forest_guid)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "DELETE FROM active_directory_group WHERE forest_guid = ? AND is_main_group = 1",
                )
                .bind(forest_guid)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "UPDATE active_directory_group SET is_deleted = 1, is_sent_to_webserver = 0 \
                     WHERE forest_guid = ?",
                )
                .bind(forest_guid)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "DELETE FROM active_directory_forest_group_membership WHERE forest_guid = ?",
                )
                .bind(forest_guid)
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM active_directory_forest WHERE object_guid = ?")
                    .bind(forest_guid)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM active_directory_sync_context WHERE forest_guid = ?")
                    .bind(forest_guid)
                    .execute(&mut *tx)
                    .await?;
            } else {
                if fc.changes.contains(ForestChanges::CREDENTIALS_CHANGED) {
                    sqlx::query(
                        "UPDATE active_directory_forest SET user_name = ?, password = ? \
                         WHERE object_guid = ?",
                    )
                    .bind(&fc.forest.user_name)
                    .bind(&fc.forest.password)
                    .bind(forest_guid)
                    .execute(&mut *tx)
                    .await?;
                }
                if fc.changes.contains(ForestChanges::SYNC_GROUP_CHANGED) {
                    sqlx::query(
                        "UPDATE active_directory_forest SET sync_group = ? WHERE object_guid = ?",
                    )
                    .bind(&fc.forest.sync_group)
                    .bind(forest_guid)
                    .execute(&mut *tx)
                    .await?;
                    // A new sync group forces a full re-scan
                    sqlx::query("DELETE FROM active_directory_sync_context WHERE forest_guid = ?")
                        .bind(forest_guid)
                        .execute(&mut *tx)
                        .await?;
                }
            }

            for dcc in &fc.domain_controller_changes {
                match dcc.change {
                    DomainControllerChange::Added => {
                        sqlx::query(
                            "INSERT INTO active_directory_forest_dc_membership \
                             (forest_guid, host, dns_name, is_primary) VALUES (?, ?, ?, ?)",
                        )
                        .bind(forest_guid)
                        .bind(&dcc.domain_controller.host)
                        .bind(&dcc.domain_controller.dns_name)
                        .bind(dcc.domain_controller.is_primary as i64)
                        .execute(&mut *tx)
                        .await?;
                    }
                    DomainControllerChange::IsPrimaryChanged => {
                        sqlx::query(
                            "UPDATE active_directory_forest_dc_membership SET is_primary = ? \
                             WHERE forest_guid = ? AND host = ?",
                        )
                        .bind(dcc.domain_controller.is_primary as i64)
                        .bind(forest_guid)
                        .bind(&dcc.domain_controller.host)
                        .execute(&mut *tx)
                        .await?;
                    }
                    DomainControllerChange::Deleted => {
                        sqlx::query(
                            "DELETE FROM active_directory_forest_dc_membership \
                             WHERE forest_guid = ? AND host = ?",
                        )
                        .bind(forest_guid)
                        .bind(&dcc.domain_controller.host)
                        .execute(&mut *tx)
                        .await?;
                        sqlx::query(
                            "DELETE FROM active_directory_sync_context WHERE dc_host = ?",
                        )
                        .bind(&dcc.domain_controller.host)
                        .execute(&mut *tx)
                        .await?;
                    }
                }
            }
        }

        tx.commit().await?;
        tracing::debug!("Committed transaction: update AD forests");
        Ok(())
    }

    async fn update_controller_dns_name(
        &self,
        forest_guid: &str,
        host: &str,
        dns_name: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE active_directory_forest_dc_membership SET dns_name = ? \
             WHERE forest_guid = ? AND host = ?",
        )
        .bind(dns_name)
        .bind(forest_guid)
        .bind(host)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_sync_database(&self) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "active_directory_forest",
            "active_directory_forest_dc_membership",
            "active_directory_forest_group_membership",
            "active_directory_sync_context",
            "active_directory_user",
            "active_directory_group",
            "active_directory_user_group_membership",
            "active_directory_user_avatar",
            "active_directory_event",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // --- Sync contexts ---

    async fn sync_context(
        &self,
        forest_guid: &str,
        dc_host: &str,
    ) -> anyhow::Result<Option<SyncContext>> {
        let row = sqlx::query(
            "SELECT forest_guid, dc_host, invocation_id, highest_committed_usn, last_full_sync, \
             dc_dns_name FROM active_directory_sync_context WHERE forest_guid = ? AND dc_host = ?",
        )
        .bind(forest_guid)
        .bind(dc_host)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(SyncContext {
                forest_guid: row.get("forest_guid"),
                dc_host: row.get("dc_host"),
                invocation_id: row.get("invocation_id"),
                highest_committed_usn: row.get("highest_committed_usn"),
                last_full_sync: parse_optional_datetime(row.get("last_full_sync"))?,
                dc_dns_name: row.get("dc_dns_name"),
            })),
            None => Ok(None),
        }
    }

    async fn upsert_sync_context(&self, ctx: &SyncContext) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO active_directory_sync_context \
             (forest_guid, dc_host, invocation_id, highest_committed_usn, last_full_sync, dc_dns_name) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (forest_guid, dc_host) DO UPDATE SET \
             invocation_id = excluded.invocation_id, \
             highest_committed_usn = excluded.highest_committed_usn, \
             last_full_sync = excluded.last_full_sync, \
             dc_dns_name = excluded.dc_dns_name",
        )
        .bind(&ctx.forest_guid)
        .bind(&ctx.dc_host)
        .bind(&ctx.invocation_id)
        .bind(&ctx.highest_committed_usn)
        .bind(ctx.last_full_sync.map(|dt| dt.to_rfc3339()))
        .bind(&ctx.dc_dns_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_all_last_full_sync(&self) -> anyhow::Result<()> {
        sqlx::query("UPDATE active_directory_sync_context SET last_full_sync = NULL")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Users ---

    async fn user_by_guid(&self, guid: &str) -> anyhow::Result<Option<DbUser>> {
        let row = sqlx::query("SELECT * FROM active_directory_user WHERE object_guid = ?")
            .bind(guid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| user_from_row(&r)).transpose()?)
    }

    async fn user_exists(&self, guid: &str) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT 1 FROM active_directory_user WHERE object_guid = ?")
            .bind(guid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn insert_user(&self, user: &DbUser) -> anyhow::Result<()> {
        let sql = format!("INSERT INTO active_directory_user {USER_UPSERT_SQL}");
        bind_user_values(sqlx::query(&sql), user)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_user(&self, user: &DbUser) -> anyhow::Result<()> {
        let sql = format!("INSERT OR REPLACE INTO active_directory_user {USER_UPSERT_SQL}");
        bind_user_values(sqlx::query(&sql), user)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_user(&self, guid: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM active_directory_user WHERE object_guid = ?")
            .bind(guid)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM active_directory_user_avatar WHERE user_object_guid = ?")
            .bind(guid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_users_deleted(&self, guids: &[String]) -> anyhow::Result<u64> {
        if guids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE active_directory_user SET is_deleted = 1, is_sent_to_webserver = 0 \
             WHERE is_deleted = 0 AND object_guid IN ({})",
            placeholders(guids.len())
        );
        let mut query = sqlx::query(&sql);
        for guid in guids {
            query = query.bind(guid);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn set_status_for_present_users_of_forest(
        &self,
        status: AdStatus,
        forest_guid: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE active_directory_user SET ad_status = ? \
             WHERE forest_guid = ? AND ad_status = ?",
        )
        .bind(status.to_code())
        .bind(forest_guid)
        .bind(AdStatus::Present.to_code())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_status_for_users_of_forest(
        &self,
        new_status: AdStatus,
        if_old_status: AdStatus,
        forest_guid: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE active_directory_user SET ad_status = ? \
             WHERE forest_guid = ? AND ad_status = ?",
        )
        .bind(new_status.to_code())
        .bind(forest_guid)
        .bind(if_old_status.to_code())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_status_for_members_of_group(
        &self,
        new_status: AdStatus,
        if_old_status: AdStatus,
        group_guid: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE active_directory_user SET ad_status = ? WHERE ad_status = ? AND object_guid IN \
             (SELECT user_guid FROM active_directory_user_group_membership WHERE group_guid = ?)",
        )
        .bind(new_status.to_code())
        .bind(if_old_status.to_code())
        .bind(group_guid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_users_with_status_of_forest(
        &self,
        status: AdStatus,
        forest_guid: &str,
    ) -> anyhow::Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM active_directory_user WHERE ad_status = ? AND forest_guid = ?",
        )
        .bind(status.to_code())
        .bind(forest_guid)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    async fn count_users_with_status_not_sent(&self, status: AdStatus) -> anyhow::Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM active_directory_user \
             WHERE ad_status = ? AND is_sent_to_webserver = 0",
        )
        .bind(status.to_code())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    async fn users_not_present_of_forest(
        &self,
        forest_guid: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<DbUser>> {
        let rows = sqlx::query(
            "SELECT * FROM active_directory_user \
             WHERE forest_guid = ? AND ad_status IN (?, ?) LIMIT ?",
        )
        .bind(forest_guid)
        .bind(AdStatus::Unknown.to_code())
        .bind(AdStatus::NotPresent.to_code())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| user_from_row(r).map_err(Into::into))
            .collect()
    }

    async fn mark_users_deleted_with_status_of_forest(
        &self,
        forest_guid: &str,
        status: AdStatus,
    ) -> anyhow::Result<u64> {
        // Flip the residual rows to NotPresent, then mark them deleted
        sqlx::query(
            "UPDATE active_directory_user SET ad_status = ? \
             WHERE forest_guid = ? AND ad_status = ?",
        )
        .bind(AdStatus::NotPresent.to_code())
        .bind(forest_guid)
        .bind(status.to_code())
        .execute(&self.pool)
        .await?;

        let result = sqlx::query(
            "UPDATE active_directory_user SET is_deleted = 1, is_sent_to_webserver = 0 \
             WHERE forest_guid = ? AND ad_status = ? AND is_deleted = 0",
        )
        .bind(forest_guid)
        .bind(AdStatus::NotPresent.to_code())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn clear_user_webserver_error_not_in(&self, permanent: &[u16]) -> anyhow::Result<()> {
        let sql = format!(
            "UPDATE active_directory_user SET webserver_error = 0 \
             WHERE webserver_error != 0 AND webserver_error NOT IN ({})",
            placeholders(permanent.len())
        );
        let mut query = sqlx::query(&sql);
        for code in permanent {
            query = query.bind(*code as i64);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn user_not_sent_to_webserver(&self, skip: i64) -> anyhow::Result<Option<DbUser>> {
        let row = sqlx::query(
            "SELECT * FROM active_directory_user WHERE is_sent_to_webserver = 0 \
             ORDER BY rowid ASC LIMIT 1 OFFSET ?",
        )
        .bind(skip)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| user_from_row(&r)).transpose()?)
    }

    async fn count_users_not_sent_to_webserver(&self) -> anyhow::Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM active_directory_user WHERE is_sent_to_webserver = 0",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    // --- Avatars ---

    async fn upsert_avatar(&self, avatar: &DbUserAvatar) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO active_directory_user_avatar (user_object_guid, avatar, avatar_md5) \
             VALUES (?, ?, ?) \
             ON CONFLICT (user_object_guid) DO UPDATE SET \
             avatar = excluded.avatar, avatar_md5 = excluded.avatar_md5",
        )
        .bind(&avatar.user_object_guid)
        .bind(&avatar.avatar)
        .bind(&avatar.avatar_md5)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn avatar_of_user(&self, guid: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let row = sqlx::query(
            "SELECT avatar FROM active_directory_user_avatar WHERE user_object_guid = ?",
        )
        .bind(guid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("avatar")))
    }

    async fn delete_all_avatars(&self) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM active_directory_user_avatar")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Groups ---

    async fn group_by_guid(&self, guid: &str) -> anyhow::Result<Option<DbGroup>> {
        let row = sqlx::query("SELECT * FROM active_directory_group WHERE object_guid = ?")
            .bind(guid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| group_from_row(&r)).transpose()?)
    }

    async fn group_by_dn(&self, distinguished_name: &str) -> anyhow::Result<Option<DbGroup>> {
        let row =
            sqlx::query("SELECT * FROM active_directory_group WHERE distinguished_name = ?")
                .bind(distinguished_name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| group_from_row(&r)).transpose()?)
    }

    async fn group_exists(&self, guid: &str) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT 1 FROM active_directory_group WHERE object_guid = ?")
            .bind(guid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn insert_group(&self, group: &DbGroup) -> anyhow::Result<()> {
        let sql = format!("INSERT INTO active_directory_group {GROUP_UPSERT_SQL}");
        bind_group_values(sqlx::query(&sql), group)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_group(&self, group: &DbGroup) -> anyhow::Result<()> {
        let sql = format!("INSERT OR REPLACE INTO active_directory_group {GROUP_UPSERT_SQL}");
        bind_group_values(sqlx::query(&sql), group)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_group(&self, guid: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM active_directory_group WHERE object_guid = ?")
            .bind(guid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_status_for_groups_of_forest(
        &self,
        status: AdStatus,
        forest_guid: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE active_directory_group SET ad_status = ? \
             WHERE forest_guid = ? AND ad_status = ?",
        )
        .bind(status.to_code())
        .bind(forest_guid)
        .bind(AdStatus::Present.to_code())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_groups_with_status_of_forest(
        &self,
        status: AdStatus,
        forest_guid: &str,
    ) -> anyhow::Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM active_directory_group \
             WHERE ad_status = ? AND forest_guid = ?",
        )
        .bind(status.to_code())
        .bind(forest_guid)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    async fn groups_not_present_of_forest(
        &self,
        forest_guid: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<DbGroup>> {
        let rows = sqlx::query(
            "SELECT * FROM active_directory_group \
             WHERE forest_guid = ? AND ad_status IN (?, ?) LIMIT ?",
        )
        .bind(forest_guid)
        .bind(AdStatus::Unknown.to_code())
        .bind(AdStatus::NotPresent.to_code())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| group_from_row(r).map_err(Into::into))
            .collect()
    }

    async fn mark_groups_deleted_with_status_of_forest(
        &self,
        forest_guid: &str,
        status: AdStatus,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE active_directory_group SET is_deleted = 1, is_sent_to_webserver = 0 \
             WHERE forest_guid = ? AND ad_status = ? AND is_deleted = 0 AND is_main_group = 0",
        )
        .bind(forest_guid)
        .bind(status.to_code())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_main_groups_of_forest(&self, forest_guid: &str) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM active_directory_group WHERE forest_guid = ? AND is_main_group = 1",
        )
        .bind(forest_guid)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_main_groups_not_present_of_forest(
        &self,
        forest_guid: &str,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM active_directory_group \
             WHERE forest_guid = ? AND is_main_group = 1 AND ad_status != ?",
        )
        .bind(forest_guid)
        .bind(AdStatus::Present.to_code())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_deleted_unsent_groups_with_cloud_id(&self) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE active_directory_group SET is_deleted = 1, is_sent_to_webserver = 0 \
             WHERE is_main_group = 0 AND is_deleted = 0 AND qliq_id != ''",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn update_group_usn_changed(&self, group_guid: &str, usn: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE active_directory_group SET usn_changed = ? WHERE object_guid = ?")
            .bind(usn)
            .bind(group_guid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_group_webserver_error_not_in(&self, permanent: &[u16]) -> anyhow::Result<()> {
        let sql = format!(
            "UPDATE active_directory_group SET webserver_error = 0 \
             WHERE webserver_error != 0 AND webserver_error NOT IN ({})",
            placeholders(permanent.len())
        );
        let mut query = sqlx::query(&sql);
        for code in permanent {
            query = query.bind(*code as i64);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn group_not_sent_to_webserver(&self, skip: i64) -> anyhow::Result<Option<DbGroup>> {
        let row = sqlx::query(
            "SELECT * FROM active_directory_group WHERE is_sent_to_webserver = 0 \
             ORDER BY rowid ASC LIMIT 1 OFFSET ?",
        )
        .bind(skip)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| group_from_row(&r)).transpose()?)
    }

    // --- Memberships ---

    async fn add_user_to_group(&self, user_guid: &str, group_guid: &str) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO active_directory_user_group_membership (user_guid, group_guid) \
             VALUES (?, ?)",
        )
        .bind(user_guid)
        .bind(group_guid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_user_from_all_groups(&self, user_guid: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM active_directory_user_group_membership WHERE user_guid = ?")
            .bind(user_guid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_all_users_from_group(&self, group_guid: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM active_directory_user_group_membership WHERE group_guid = ?")
            .bind(group_guid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_stale_members_of_group(&self, group_guid: &str) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM active_directory_user_group_membership WHERE group_guid = ? \
             AND user_guid IN (SELECT object_guid FROM active_directory_user WHERE ad_status != ?)",
        )
        .bind(group_guid)
        .bind(AdStatus::Present.to_code())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn groups_of_user(&self, user_guid: &str) -> anyhow::Result<Vec<DbGroup>> {
        let rows = sqlx::query(
            "SELECT g.* FROM active_directory_group g \
             JOIN active_directory_user_group_membership m ON m.group_guid = g.object_guid \
             WHERE m.user_guid = ?",
        )
        .bind(user_guid)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| group_from_row(r).map_err(Into::into))
            .collect()
    }

    async fn group_ids_of_user(&self, user_guid: &str) -> anyhow::Result<HashSet<String>> {
        let rows = sqlx::query(
            "SELECT group_guid FROM active_directory_user_group_membership WHERE user_guid = ?",
        )
        .bind(user_guid)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("group_guid")).collect())
    }

    async fn save_forest_group_membership(
        &self,
        forest_guid: &str,
        group_guid: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO active_directory_forest_group_membership \
             (forest_guid, group_guid) VALUES (?, ?)",
        )
        .bind(forest_guid)
        .bind(group_guid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_forest_group_membership(&self, group_guid: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM active_directory_forest_group_membership WHERE group_guid = ?")
            .bind(group_guid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Events ---

    async fn insert_event(&self, event: &Event) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO active_directory_event (timestamp, type, category, message) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(event.timestamp.to_rfc3339())
        .bind(event.event_type.as_str())
        .bind(event.category.as_str())
        .bind(&event.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn events_page(&self, offset: i64, count: i64) -> anyhow::Result<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT id, timestamp, type, category, message FROM active_directory_event \
             ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(count)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| event_from_row(r).map_err(Into::into))
            .collect()
    }

    async fn delete_all_events(&self) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM active_directory_event")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_events_older_than_days(&self, days: i64) -> anyhow::Result<u64> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let result = sqlx::query("DELETE FROM active_directory_event WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
