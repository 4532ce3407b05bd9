//! Directory attribute names and entry→entity mapping
//!
//! The attribute sets requested from the server and the conversion of raw
//! search entries into [`AdUser`]/[`AdGroup`] values. `objectGUID` arrives
//! as 16 binary bytes in Microsoft's mixed-endian layout and is formatted
//! into its canonical string form here.

use adbridge_core::domain::entity::{AdGroup, AdUser, ValidState};
use ldap3::SearchEntry;

/// Attributes requested for live user searches
pub const USER_ATTRS: &[&str] = &[
    "distinguishedName",
    "name",
    "givenName",
    "middleName",
    "sn",
    "displayName",
    "mail",
    "telephoneNumber",
    "mobile",
    "title",
    "userPrincipalName",
    "uSNChanged",
    "objectGUID",
    "isDeleted",
    "userAccountControl",
    "msDS-User-Account-Control-Computed",
    "cn",
    "unicodePwd",
    "sAMAccountName",
    "memberOf",
    "objectClass",
    "employeeNumber",
    "o",
    "division",
    "department",
    "pwdLastSet",
];

/// Avatar attributes, appended only when avatar sync is enabled
pub const AVATAR_ATTRS: &[&str] = &["thumbnailPhoto", "jpegPhoto"];

/// Attributes requested for group searches
pub const GROUP_ATTRS: &[&str] = &[
    "distinguishedName",
    "name",
    "cn",
    "uSNChanged",
    "objectGUID",
    "isDeleted",
    "sAMAccountName",
    "memberOf",
    "member",
    "objectClass",
];

/// Attributes requested for the tombstone scan
pub const DELETED_ATTRS: &[&str] = &["objectGUID", "uSNChanged"];

/// Formats a binary `objectGUID` into its canonical string form.
///
/// The first three groups are little-endian in the wire encoding.
pub fn format_guid(bytes: &[u8]) -> Option<String> {
    if bytes.len() != 16 {
        return None;
    }
    Some(format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        bytes[3], bytes[2], bytes[1], bytes[0],
        bytes[5], bytes[4],
        bytes[7], bytes[6],
        bytes[8], bytes[9],
        bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
    ))
}

fn first(entry: &SearchEntry, attr: &str) -> String {
    entry
        .attrs
        .get(attr)
        .and_then(|values| values.first())
        .cloned()
        .unwrap_or_default()
}

fn all(entry: &SearchEntry, attr: &str) -> Vec<String> {
    entry.attrs.get(attr).cloned().unwrap_or_default()
}

fn first_u32(entry: &SearchEntry, attr: &str) -> u32 {
    first(entry, attr).parse().unwrap_or(0)
}

fn first_bool(entry: &SearchEntry, attr: &str) -> bool {
    first(entry, attr).eq_ignore_ascii_case("true")
}

/// Extracts the formatted `objectGUID`, preferring the binary encoding
pub fn guid_from_entry(entry: &SearchEntry) -> Option<String> {
    if let Some(values) = entry.bin_attrs.get("objectGUID") {
        if let Some(bytes) = values.first() {
            return format_guid(bytes);
        }
    }
    // Some servers hand GUIDs back as printable strings
    let text = first(entry, "objectGUID");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Maps a search entry to a user; `None` when the entry has no usable GUID
pub fn user_from_entry(entry: &SearchEntry) -> Option<AdUser> {
    let object_guid = guid_from_entry(entry)?;

    let mut user = AdUser {
        user_principal_name: first(entry, "userPrincipalName"),
        given_name: first(entry, "givenName"),
        middle_name: first(entry, "middleName"),
        sn: first(entry, "sn"),
        display_name: first(entry, "displayName"),
        mail: first(entry, "mail"),
        telephone_number: first(entry, "telephoneNumber"),
        mobile: first(entry, "mobile"),
        title: first(entry, "title"),
        employee_number: first(entry, "employeeNumber"),
        organization: first(entry, "o"),
        division: first(entry, "division"),
        department: first(entry, "department"),
        user_account_control: first_u32(entry, "userAccountControl"),
        user_account_control_computed: first_u32(entry, "msDS-User-Account-Control-Computed"),
        pwd_last_set: first(entry, "pwdLastSet"),
        ..AdUser::default()
    };

    user.entity.object_guid = object_guid;
    user.entity.distinguished_name = first(entry, "distinguishedName");
    user.entity.cn = first(entry, "cn");
    user.entity.account_name = first(entry, "sAMAccountName");
    user.entity.object_classes = all(entry, "objectClass");
    user.entity.member_of = all(entry, "memberOf");
    user.entity.usn_changed = first(entry, "uSNChanged");
    user.entity.is_deleted = first_bool(entry, "isDeleted");
    user.entity.valid_state = ValidState::Invalid;

    for attr in AVATAR_ATTRS {
        if let Some(values) = entry.bin_attrs.get(*attr) {
            if let Some(bytes) = values.first() {
                if !bytes.is_empty() {
                    user.avatar = bytes.clone();
                    break;
                }
            }
        }
    }
    user.compute_avatar_md5();

    Some(user)
}

/// Maps a search entry to a group; `None` when the entry has no usable GUID
pub fn group_from_entry(entry: &SearchEntry) -> Option<AdGroup> {
    let object_guid = guid_from_entry(entry)?;

    let mut group = AdGroup {
        members: all(entry, "member"),
        ..AdGroup::default()
    };
    group.entity.object_guid = object_guid;
    group.entity.distinguished_name = first(entry, "distinguishedName");
    group.entity.cn = first(entry, "cn");
    group.entity.account_name = first(entry, "sAMAccountName");
    group.entity.object_classes = all(entry, "objectClass");
    group.entity.member_of = all(entry, "memberOf");
    group.entity.usn_changed = first(entry, "uSNChanged");
    group.entity.is_deleted = first_bool(entry, "isDeleted");
    group.entity.valid_state = ValidState::Invalid;

    Some(group)
}
