//! Directory entities: the common base plus users and groups
//!
//! These are transient copies of what the directory returned during an
//! enumeration pass. Persisted bookkeeping lives in the overlays in
//! [`super::overlay`].

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// `userAccountControl`: account is disabled
pub const UAC_ACCOUNT_DISABLE: u32 = 0x2;
/// Reserved local bit: the user's directory password changed since the last
/// successful push. Never set by the directory itself; preserved across
/// updates and cleared after a successful cloud POST/PUT.
pub const UAC_LOCAL_PASSWORD_CHANGED: u32 = 0x4;
/// `userAccountControl`: password cannot change
pub const UAC_PASSWD_CANT_CHANGE: u32 = 0x40;
/// `msDS-User-Account-Control-Computed`: account is locked out
pub const UAC_COMPUTED_LOCKOUT: u32 = 0x10;
/// `msDS-User-Account-Control-Computed`: password expired
pub const UAC_COMPUTED_PASSWORD_EXPIRED: u32 = 0x80_0000;

/// Validation state of an entity with respect to the cloud's constraints
///
/// `Rejected` carries the HTTP status the cloud answered with when a
/// locally-valid record was refused (400 or 422).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidState {
    #[default]
    Invalid,
    Valid,
    Rejected(u16),
}

impl ValidState {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidState::Valid)
    }

    /// Storage encoding: 0 invalid, 1 valid, HTTP code otherwise
    pub fn to_code(self) -> u16 {
        match self {
            ValidState::Invalid => 0,
            ValidState::Valid => 1,
            ValidState::Rejected(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0 => ValidState::Invalid,
            1 => ValidState::Valid,
            other => ValidState::Rejected(other),
        }
    }
}

/// Attributes common to user and group objects
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdEntity {
    pub object_guid: String,
    pub distinguished_name: String,
    pub cn: String,
    /// `sAMAccountName`
    pub account_name: String,
    pub object_classes: Vec<String>,
    /// Full DN paths of the groups this object is a member of
    pub member_of: Vec<String>,
    /// Monotone per-object change sequence number, kept as the string the
    /// directory reports; empty means unknown
    pub usn_changed: String,
    pub is_deleted: bool,
    pub valid_state: ValidState,
}

impl AdEntity {
    pub fn is_empty(&self) -> bool {
        self.object_guid.is_empty()
    }

    pub fn is_group(&self) -> bool {
        self.object_classes.iter().any(|c| c == "group")
    }

    pub fn is_user(&self) -> bool {
        self.object_classes.iter().any(|c| c == "user")
    }

    /// For a DN string `CN=a,CN=b,OU=c,DC=d` returns the value of the first CN
    pub fn extract_top_level_cn(path: &str) -> String {
        for part in path.split(',') {
            let part = part.trim();
            if let Some(value) = part.strip_prefix("CN=").or_else(|| part.strip_prefix("cn=")) {
                return value.to_string();
            }
        }
        String::new()
    }
}

/// A user object as enumerated from the directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdUser {
    #[serde(flatten)]
    pub entity: AdEntity,
    /// `login@domain`, maps to SCIM `userName`
    pub user_principal_name: String,
    pub given_name: String,
    pub middle_name: String,
    /// Surname (`sn`)
    pub sn: String,
    pub display_name: String,
    pub mail: String,
    pub telephone_number: String,
    pub mobile: String,
    pub title: String,
    pub employee_number: String,
    pub organization: String,
    pub division: String,
    pub department: String,
    pub user_account_control: u32,
    /// Computed flags (lockout, password expired) come from
    /// `msDS-User-Account-Control-Computed`
    pub user_account_control_computed: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub avatar: Vec<u8>,
    pub avatar_md5: String,
    pub pwd_last_set: String,
}

impl AdUser {
    pub fn is_disabled(&self) -> bool {
        self.user_account_control & UAC_ACCOUNT_DISABLE != 0
    }

    pub fn is_locked(&self) -> bool {
        self.user_account_control_computed & UAC_COMPUTED_LOCKOUT != 0
    }

    pub fn is_password_expired(&self) -> bool {
        self.user_account_control_computed & UAC_COMPUTED_PASSWORD_EXPIRED != 0
    }

    pub fn is_password_cant_change(&self) -> bool {
        self.user_account_control & UAC_PASSWD_CANT_CHANGE != 0
    }

    pub fn is_password_changed(&self) -> bool {
        self.user_account_control & UAC_LOCAL_PASSWORD_CHANGED != 0
    }

    pub fn set_password_changed_flag(&mut self, on: bool) {
        if on {
            self.user_account_control |= UAC_LOCAL_PASSWORD_CHANGED;
        } else {
            self.user_account_control &= !UAC_LOCAL_PASSWORD_CHANGED;
        }
    }

    pub fn first_name(&self) -> &str {
        &self.given_name
    }

    pub fn last_name(&self) -> &str {
        &self.sn
    }

    pub fn login(&self) -> &str {
        &self.user_principal_name
    }

    /// Preferred phone: mobile when available, landline otherwise
    pub fn phone(&self) -> &str {
        if self.mobile.is_empty() {
            &self.telephone_number
        } else {
            &self.mobile
        }
    }

    /// First name, or the account name when the directory has none.
    /// The cloud requires a given name on every user record.
    pub fn first_name_or_fake(&self) -> String {
        if !self.given_name.is_empty() {
            self.given_name.clone()
        } else {
            self.entity.account_name.clone()
        }
    }

    /// Last name fallback mirroring [`Self::first_name_or_fake`]
    pub fn last_name_or_fake(&self) -> String {
        if !self.sn.is_empty() {
            self.sn.clone()
        } else {
            "(none)".to_string()
        }
    }

    /// Recomputes the avatar digest from the current avatar bytes
    pub fn compute_avatar_md5(&mut self) {
        if self.avatar.is_empty() {
            self.avatar_md5.clear();
        } else {
            let digest = Md5::digest(&self.avatar);
            self.avatar_md5 = format!("{digest:x}");
        }
    }

    /// Field-wise comparison of the attributes that matter for change
    /// detection. Avatars compare by digest; membership changes are
    /// detected separately against the stored membership rows.
    pub fn fields_equal(&self, other: &AdUser) -> bool {
        self.entity.object_guid == other.entity.object_guid
            && self.entity.distinguished_name == other.entity.distinguished_name
            && self.entity.is_deleted == other.entity.is_deleted
            && self.user_principal_name == other.user_principal_name
            && self.given_name == other.given_name
            && self.middle_name == other.middle_name
            && self.sn == other.sn
            && self.display_name == other.display_name
            && self.mail == other.mail
            && self.telephone_number == other.telephone_number
            && self.mobile == other.mobile
            && self.title == other.title
            && self.user_account_control == other.user_account_control
            && self.user_account_control_computed == other.user_account_control_computed
            && self.employee_number == other.employee_number
            && self.organization == other.organization
            && self.division == other.division
            && self.department == other.department
            && self.avatar_md5 == other.avatar_md5
            && self.pwd_last_set == other.pwd_last_set
    }
}

/// A group object as enumerated from the directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdGroup {
    #[serde(flatten)]
    pub entity: AdEntity,
    /// Member DNs
    pub members: Vec<String>,
}

impl AdGroup {
    /// Human-facing name: the top-level CN of the group's `cn` path
    pub fn display_name(&self) -> String {
        let name = AdEntity::extract_top_level_cn(&self.entity.cn);
        if name.is_empty() {
            self.entity.cn.clone()
        } else {
            name
        }
    }

    /// Attribute comparison for change detection
    pub fn fields_equal(&self, other: &AdGroup) -> bool {
        self.entity.object_guid == other.entity.object_guid
            && self.entity.distinguished_name == other.entity.distinguished_name
            && self.entity.cn == other.entity.cn
            && self.entity.is_deleted == other.entity.is_deleted
            && self.members == other.members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_top_level_cn() {
        assert_eq!(
            AdEntity::extract_top_level_cn("CN=Nurses,CN=Users,DC=dir,DC=example,DC=com"),
            "Nurses"
        );
        assert_eq!(AdEntity::extract_top_level_cn("OU=x,DC=y"), "");
        assert_eq!(AdEntity::extract_top_level_cn("Nurses"), "");
    }

    #[test]
    fn test_uac_flags() {
        let mut user = AdUser::default();
        assert!(!user.is_disabled());

        user.user_account_control = UAC_ACCOUNT_DISABLE | UAC_PASSWD_CANT_CHANGE;
        assert!(user.is_disabled());
        assert!(user.is_password_cant_change());

        user.user_account_control_computed = UAC_COMPUTED_LOCKOUT | UAC_COMPUTED_PASSWORD_EXPIRED;
        assert!(user.is_locked());
        assert!(user.is_password_expired());
    }

    #[test]
    fn test_password_changed_flag_preserved() {
        let mut user = AdUser::default();
        user.user_account_control = UAC_ACCOUNT_DISABLE;
        user.set_password_changed_flag(true);
        assert!(user.is_password_changed());
        assert!(user.is_disabled());

        user.set_password_changed_flag(false);
        assert!(!user.is_password_changed());
        assert!(user.is_disabled());
    }

    #[test]
    fn test_avatar_md5() {
        let mut user = AdUser::default();
        user.avatar = b"avatar-bytes".to_vec();
        user.compute_avatar_md5();
        assert_eq!(user.avatar_md5.len(), 32);

        let first = user.avatar_md5.clone();
        user.avatar = b"other-bytes".to_vec();
        user.compute_avatar_md5();
        assert_ne!(user.avatar_md5, first);

        user.avatar.clear();
        user.compute_avatar_md5();
        assert!(user.avatar_md5.is_empty());
    }

    #[test]
    fn test_fields_equal_ignores_usn() {
        let mut a = AdUser {
            user_principal_name: "alice@x".to_string(),
            ..AdUser::default()
        };
        a.entity.object_guid = "U1".to_string();

        let mut b = a.clone();
        b.entity.usn_changed = "999".to_string();
        assert!(a.fields_equal(&b));

        b.mail = "alice@example.com".to_string();
        assert!(!a.fields_equal(&b));
    }

    #[test]
    fn test_group_display_name() {
        let mut group = AdGroup::default();
        group.entity.cn = "CN=Nurses,CN=Users,DC=x".to_string();
        assert_eq!(group.display_name(), "Nurses");

        group.entity.cn = "Nurses".to_string();
        assert_eq!(group.display_name(), "Nurses");
    }

    #[test]
    fn test_valid_state_codes() {
        assert_eq!(ValidState::from_code(0), ValidState::Invalid);
        assert_eq!(ValidState::from_code(1), ValidState::Valid);
        assert_eq!(ValidState::from_code(422), ValidState::Rejected(422));
        assert_eq!(ValidState::Rejected(400).to_code(), 400);
    }
}
