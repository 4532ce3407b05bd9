//! LDAP request controls used by the bridge
//!
//! Two Microsoft-specific controls are needed: server-side sorting (so
//! results arrive in `uSNChanged` order) and Show Deleted (so the
//! tombstone container becomes visible to searches).

use ldap3::controls::RawControl;

/// Server-side sort request control (RFC 2891)
pub const SERVER_SORT_OID: &str = "1.2.840.113556.1.4.473";

/// Show Deleted control: makes tombstoned objects visible
pub const SHOW_DELETED_OID: &str = "1.2.840.113556.1.4.417";

/// BER-encodes a single-key SortKeyList:
/// `SEQUENCE { SEQUENCE { attributeType OCTET STRING } }`
fn encode_sort_key_list(attribute: &str) -> Vec<u8> {
    let name = attribute.as_bytes();
    debug_assert!(name.len() < 0x80);

    let mut inner = Vec::with_capacity(name.len() + 4);
    inner.push(0x30); // SEQUENCE (one sort key)
    inner.push((name.len() + 2) as u8);
    inner.push(0x04); // OCTET STRING attributeType
    inner.push(name.len() as u8);
    inner.extend_from_slice(name);

    let mut outer = Vec::with_capacity(inner.len() + 2);
    outer.push(0x30); // SEQUENCE OF
    outer.push(inner.len() as u8);
    outer.extend_from_slice(&inner);
    outer
}

/// Sort control requesting ascending `uSNChanged` order
pub fn sort_by_usn_changed() -> RawControl {
    RawControl {
        ctype: SERVER_SORT_OID.to_string(),
        crit: true,
        val: Some(encode_sort_key_list("uSNChanged")),
    }
}

/// Show Deleted control for the tombstone scan
pub fn show_deleted() -> RawControl {
    RawControl {
        ctype: SHOW_DELETED_OID.to_string(),
        crit: true,
        val: None,
    }
}
