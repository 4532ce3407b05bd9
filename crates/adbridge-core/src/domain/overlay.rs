//! Persisted overlays: directory entities plus push bookkeeping
//!
//! The store is the source of truth for everything the cloud side needs to
//! know about an entity beyond its directory attributes: the cloud id once
//! assigned, whether the latest local state has been pushed, the last
//! webserver error, and the presence status driving deletion detection.

use serde::{Deserialize, Serialize};

use super::entity::{AdGroup, AdUser};

/// Presence status of a row with respect to the most recent enumeration
///
/// At the start of each per-forest sync every `Present` row of the forest is
/// flipped to `Unknown`; enumeration flips matched rows back to `Present`.
/// Whatever is still `Unknown` afterwards defines "not present" and becomes
/// the deletion candidate pool. `PresentInOtherGroups` marks users that
/// dropped out of one group but remain members of another group of the same
/// forest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdStatus {
    #[default]
    Unknown,
    Present,
    NotPresent,
    PresentInOtherGroups,
}

impl AdStatus {
    /// Storage encoding, stable across releases
    pub fn to_code(self) -> i64 {
        match self {
            AdStatus::Unknown => 0,
            AdStatus::Present => 1,
            AdStatus::NotPresent => 2,
            AdStatus::PresentInOtherGroups => 3,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => AdStatus::Present,
            2 => AdStatus::NotPresent,
            3 => AdStatus::PresentInOtherGroups,
            _ => AdStatus::Unknown,
        }
    }
}

/// Cloud push bookkeeping shared by user and group rows
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushState {
    /// Cloud-assigned identity, empty until the first successful create
    pub qliq_id: String,
    /// Whether the current local state has been delivered to the cloud
    pub is_sent_to_webserver: bool,
    /// Last HTTP error the cloud answered with, 0 when clear
    pub webserver_error: u16,
    /// Presence status from the most recent enumeration
    pub status: AdStatus,
}

impl PushState {
    /// Permanent errors quarantine the row until its directory data changes
    pub fn has_permanent_error(&self, permanent: &[u16]) -> bool {
        self.webserver_error != 0 && permanent.contains(&self.webserver_error)
    }
}

/// A user row as persisted by the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbUser {
    #[serde(flatten)]
    pub user: AdUser,
    #[serde(flatten)]
    pub push: PushState,
    /// GUID of the forest this row was enumerated under
    #[serde(default)]
    pub forest_guid: String,
    /// Groups of this user, populated on demand for push payloads
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<DbGroup>,
}

impl DbUser {
    pub fn from_ad(user: AdUser, forest_guid: impl Into<String>) -> Self {
        Self {
            user,
            push: PushState::default(),
            forest_guid: forest_guid.into(),
            groups: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.user.entity.is_empty()
    }
}

/// A group row as persisted by the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbGroup {
    #[serde(flatten)]
    pub group: AdGroup,
    #[serde(flatten)]
    pub push: PushState,
    /// GUID of the forest this row was enumerated under
    #[serde(default)]
    pub forest_guid: String,
    /// Whether this row is a forest's configured main group. Main groups are
    /// never pushed to the cloud.
    #[serde(default)]
    pub is_main_group: bool,
}

impl DbGroup {
    pub fn from_ad(group: AdGroup, forest_guid: impl Into<String>) -> Self {
        Self {
            group,
            push: PushState::default(),
            forest_guid: forest_guid.into(),
            is_main_group: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.group.entity.is_empty()
    }

    pub fn display_name(&self) -> String {
        self.group.display_name()
    }
}

/// Avatar blob stored separately from the user row
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbUserAvatar {
    pub user_object_guid: String,
    pub avatar: Vec<u8>,
    pub avatar_md5: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for status in [
            AdStatus::Unknown,
            AdStatus::Present,
            AdStatus::NotPresent,
            AdStatus::PresentInOtherGroups,
        ] {
            assert_eq!(AdStatus::from_code(status.to_code()), status);
        }
    }

    #[test]
    fn test_permanent_error_detection() {
        let mut push = PushState::default();
        assert!(!push.has_permanent_error(&[400, 404, 422]));

        push.webserver_error = 404;
        assert!(push.has_permanent_error(&[400, 404, 422]));

        push.webserver_error = 503;
        assert!(!push.has_permanent_error(&[400, 404, 422]));
    }

    #[test]
    fn test_db_user_from_ad() {
        let mut user = AdUser::default();
        user.entity.object_guid = "U1".to_string();
        let db = DbUser::from_ad(user, "F1");
        assert!(!db.is_empty());
        assert_eq!(db.forest_guid, "F1");
        assert_eq!(db.push.status, AdStatus::Unknown);
        assert!(!db.push.is_sent_to_webserver);
    }
}
