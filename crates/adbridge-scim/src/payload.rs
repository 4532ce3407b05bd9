//! SCIM JSON payload mapping
//!
//! Converts persisted user and group rows into the cloud's wire format and
//! back-fills local data over a server copy when resolving create
//! conflicts. The cloud deviates from the SCIM standard in one documented
//! way: enterprise fields must appear both under the enterprise schema key
//! and at the top level of the object.

use adbridge_core::domain::entity::AdEntity;
use adbridge_core::domain::overlay::{DbGroup, DbUser};
use serde_json::{json, Map, Value};

/// SCIM core user schema URN
pub const USER_SCHEMA: &str = "urn:ietf:params:scim:schemas:core:2.0:User";
/// Enterprise extension URN the cloud expects
pub const ENTERPRISE_SCHEMA: &str = "urn:scim:schemas:extension:enterprise:1.0";
/// SCIM core group schema URN
pub const GROUP_SCHEMA: &str = "urn:ietf:params:scim:schemas:core:2.0:Group";

fn formatted_name(user: &DbUser) -> String {
    if !user.user.display_name.is_empty() {
        return user.user.display_name.clone();
    }
    let mut parts = Vec::new();
    let first = user.user.first_name_or_fake();
    if !first.is_empty() {
        parts.push(first);
    }
    if !user.user.middle_name.is_empty() {
        parts.push(user.user.middle_name.clone());
    }
    let last = user.user.last_name_or_fake();
    if !last.is_empty() {
        parts.push(last);
    }
    parts.join(" ")
}

/// Whether a user row satisfies the cloud's mandatory-field constraints
pub fn validate_user(user: &DbUser) -> Result<(), String> {
    if user.user.entity.object_guid.is_empty() {
        // An empty objectGuid means the record itself is corrupted
        return Err("'objectGuid' attribute is empty".to_string());
    }
    if user.user.user_principal_name.is_empty() {
        // Translates to SCIM 'userName', required by the cloud
        return Err("'userPrincipalName' attribute is empty".to_string());
    }
    if user.user.given_name.is_empty() {
        return Err("'givenName' attribute is empty".to_string());
    }
    if user.user.sn.is_empty() {
        return Err("'sn' attribute is empty".to_string());
    }
    Ok(())
}

/// Whether a group row satisfies the cloud's mandatory-field constraints
pub fn validate_group(group: &DbGroup) -> Result<(), String> {
    if group.group.entity.object_guid.is_empty() {
        return Err("'objectGuid' attribute is empty".to_string());
    }
    if group.group.entity.cn.is_empty() {
        return Err("'cn' attribute is empty".to_string());
    }
    Ok(())
}

/// Builds the SCIM JSON object for a user
///
/// `subgroups_enabled` controls whether group references are embedded;
/// with subgroups disabled the cloud only ever sees flat users.
pub fn user_to_scim(user: &DbUser, subgroups_enabled: bool) -> Value {
    let mut object = Map::new();
    let mut schemas = vec![Value::String(USER_SCHEMA.to_string())];

    object.insert("externalId".into(), json!(user.user.entity.object_guid));

    if !user.user.user_principal_name.is_empty() {
        object.insert("userName".into(), json!(user.user.user_principal_name));
    }

    let mut name = Map::new();
    name.insert("formatted".into(), json!(formatted_name(user)));
    name.insert("givenName".into(), json!(user.user.first_name_or_fake()));
    name.insert("familyName".into(), json!(user.user.last_name_or_fake()));
    if !user.user.middle_name.is_empty() {
        name.insert("middleName".into(), json!(user.user.middle_name));
    }
    object.insert("name".into(), Value::Object(name));

    if !user.user.title.is_empty() {
        object.insert("title".into(), json!(user.user.title));
    }

    if !user.user.phone().is_empty() {
        let mut numbers = Vec::new();
        if !user.user.telephone_number.is_empty() {
            numbers.push(json!({"value": user.user.telephone_number, "type": "work"}));
        }
        if !user.user.mobile.is_empty() {
            numbers.push(json!({"value": user.user.mobile, "type": "mobile"}));
        }
        object.insert("phoneNumbers".into(), Value::Array(numbers));
    }

    if !user.user.mail.is_empty() {
        object.insert(
            "emails".into(),
            json!([{"value": user.user.mail, "type": "work", "primary": true}]),
        );
    }

    let mut account_flags = Vec::new();
    if user.user.is_disabled() {
        account_flags.push("account-disabled");
    }
    if user.user.is_locked() {
        account_flags.push("account-locked");
    }
    if user.user.is_password_expired() {
        account_flags.push("password-expired");
    }
    if user.user.is_password_cant_change() {
        account_flags.push("password-cant-change");
    }
    if user.user.is_password_changed() {
        account_flags.push("password-changed");
    }
    if !account_flags.is_empty() {
        object.insert("userAccountControl".into(), json!(account_flags.join(";")));
    }

    object.insert("pwdLastSet".into(), json!(user.user.pwd_last_set));
    object.insert(
        "distinguishedName".into(),
        json!(user.user.entity.distinguished_name),
    );

    if subgroups_enabled && !user.groups.is_empty() {
        let groups: Vec<Value> = user
            .groups
            .iter()
            .map(|group| {
                json!({
                    "value": group.push.qliq_id,
                    "display": AdEntity::extract_top_level_cn(&group.group.entity.cn),
                    "$ref": format!("/Groups/{}", group.push.qliq_id),
                })
            })
            .collect();
        object.insert("groups".into(), Value::Array(groups));
    }

    let mut enterprise = Map::new();
    if !user.user.employee_number.is_empty() {
        enterprise.insert("employeeNumber".into(), json!(user.user.employee_number));
    }
    if !user.user.organization.is_empty() {
        enterprise.insert("organization".into(), json!(user.user.organization));
    }
    if !user.user.division.is_empty() {
        enterprise.insert("division".into(), json!(user.user.division));
    }
    if !user.user.department.is_empty() {
        enterprise.insert("department".into(), json!(user.user.department));
    }
    if !enterprise.is_empty() {
        schemas.push(Value::String(ENTERPRISE_SCHEMA.to_string()));
        // The cloud requires the enterprise fields at the top level too
        for (key, value) in &enterprise {
            object.insert(key.clone(), value.clone());
        }
        object.insert(ENTERPRISE_SCHEMA.into(), Value::Object(enterprise));
    }
    object.insert("schemas".into(), Value::Array(schemas));

    Value::Object(object)
}

/// Builds the SCIM JSON object for a group
pub fn group_to_scim(group: &DbGroup) -> Value {
    let mut object = Map::new();
    object.insert("schemas".into(), json!([GROUP_SCHEMA]));
    object.insert("externalId".into(), json!(group.group.entity.object_guid));
    if !group.group.entity.cn.is_empty() {
        object.insert("displayName".into(), json!(group.display_name()));
    }
    Value::Object(object)
}

/// The user fields owned by the bridge, removed from a server copy before
/// local data is layered over it during conflict resolution
const OWNED_USER_FIELDS: &[&str] = &[
    "externalId",
    "userName",
    "name",
    "title",
    "phoneNumbers",
    "emails",
    "groups",
    "employeeNumber",
    "organization",
    "division",
    "department",
];

const OWNED_GROUP_FIELDS: &[&str] = &["externalId", "displayName"];

fn strip_fields(mut server: Map<String, Value>, owned: &[&str]) -> Map<String, Value> {
    for field in owned {
        server.remove(*field);
    }
    server
}

fn layer_local(server: Map<String, Value>, local: Value) -> Value {
    let mut merged = server;
    if let Value::Object(local) = local {
        for (key, value) in local {
            merged.insert(key, value);
        }
    }
    Value::Object(merged)
}

/// Conflict-resolution merge: server copy with our fields stripped, local
/// payload layered on top
pub fn merge_user_over_server(server: Value, user: &DbUser, subgroups_enabled: bool) -> Value {
    let server = match server {
        Value::Object(map) => strip_fields(map, OWNED_USER_FIELDS),
        _ => Map::new(),
    };
    layer_local(server, user_to_scim(user, subgroups_enabled))
}

/// Group variant of [`merge_user_over_server`]
pub fn merge_group_over_server(server: Value, group: &DbGroup) -> Value {
    let server = match server {
        Value::Object(map) => strip_fields(map, OWNED_GROUP_FIELDS),
        _ => Map::new(),
    };
    layer_local(server, group_to_scim(group))
}
