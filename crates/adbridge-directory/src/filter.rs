//! USN-aware search filter composition
//!
//! Every live enumeration joins the caller's filter with a
//! `(uSNChanged>=N)` clause under an AND, so delta syncs only see objects
//! changed since the persisted watermark. The caller's filter is validated
//! first: it must be parenthesized and must not mention `uSNChanged`
//! itself, otherwise the joined expression would be ambiguous.

use adbridge_core::ports::DirectoryError;

/// Joins `filter` with a `uSNChanged` lower bound under an AND.
///
/// `(&(a)(b))` becomes `(&(uSNChanged>=N)(a)(b))`; any other parenthesized
/// filter `(x)` becomes `(&(uSNChanged>=N)(x))`.
pub fn join_with_usn_lower_bound(filter: &str, lower_bound: i64) -> Result<String, DirectoryError> {
    let filter = filter.trim();

    if !filter.starts_with('(') {
        return Err(DirectoryError::InvalidFilter(
            "search filter must start with '('".to_string(),
        ));
    }
    if filter.contains("uSNChanged") {
        return Err(DirectoryError::InvalidFilter(
            "search filter must not contain 'uSNChanged'".to_string(),
        ));
    }

    let usn_clause = format!("(uSNChanged>={lower_bound})");
    if filter.as_bytes().get(1) == Some(&b'&') {
        // Merge into the existing AND list: (&(a)(b)) -> (&(uSN..)(a)(b))
        Ok(format!("(&{usn_clause}{}", &filter[2..]))
    } else {
        Ok(format!("(&{usn_clause}{filter})"))
    }
}

/// Filter for the configured main group lookup
pub fn main_group_filter(sync_group: &str) -> String {
    format!("(&(objectClass=group)(CN={sync_group}))")
}

/// Filter for the subgroups of the main group
pub fn subgroups_filter(main_group_dn: &str) -> String {
    format!("(&(objectClass=group)(memberOf={main_group_dn}))")
}

/// Filter for the user members of one subgroup
pub fn group_members_filter(group_dn: &str) -> String {
    format!("(&(objectClass=user)(objectcategory=person)(memberOf={group_dn}))")
}

/// Filter for the tombstone-container scan. The lower bound is optional:
/// with no watermark the scan covers all tombstones.
pub fn deleted_users_filter(lower_bound: Option<i64>) -> String {
    match lower_bound {
        Some(usn) => format!("(&(objectClass=user)(isDeleted=TRUE)(cn=*)(uSNChanged>={usn}))"),
        None => "(&(objectClass=user)(isDeleted=TRUE)(cn=*))".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joins_and_filter() {
        let joined =
            join_with_usn_lower_bound("(&(objectClass=group)(CN=qliqConnect))", 4711).unwrap();
        assert_eq!(joined, "(&(uSNChanged>=4711)(objectClass=group)(CN=qliqConnect))");
    }

    #[test]
    fn test_joins_simple_filter() {
        let joined = join_with_usn_lower_bound("(cn=Nurses)", 0).unwrap();
        assert_eq!(joined, "(&(uSNChanged>=0)(cn=Nurses))");
    }

    #[test]
    fn test_rejects_unparenthesized() {
        let err = join_with_usn_lower_bound("cn=Nurses", 0).unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidFilter(_)));
    }

    #[test]
    fn test_rejects_usn_mention() {
        let err = join_with_usn_lower_bound("(&(uSNChanged>=5)(cn=x))", 0).unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidFilter(_)));
    }

    #[test]
    fn test_join_is_balanced() {
        for filter in ["(cn=x)", "(&(a)(b))", "(&(objectClass=user)(objectcategory=person)(memberOf=CN=g,DC=x))"] {
            let joined = join_with_usn_lower_bound(filter, 12).unwrap();
            let opens = joined.matches('(').count();
            let closes = joined.matches(')').count();
            assert_eq!(opens, closes, "unbalanced: {joined}");
        }
    }

    #[test]
    fn test_canned_filters() {
        assert_eq!(
            main_group_filter("qliqConnect"),
            "(&(objectClass=group)(CN=qliqConnect))"
        );
        assert_eq!(
            subgroups_filter("CN=qliqConnect,DC=x"),
            "(&(objectClass=group)(memberOf=CN=qliqConnect,DC=x))"
        );
        assert_eq!(
            group_members_filter("CN=Nurses,DC=x"),
            "(&(objectClass=user)(objectcategory=person)(memberOf=CN=Nurses,DC=x))"
        );
        assert_eq!(
            deleted_users_filter(Some(99)),
            "(&(objectClass=user)(isDeleted=TRUE)(cn=*)(uSNChanged>=99))"
        );
        assert_eq!(
            deleted_users_filter(None),
            "(&(objectClass=user)(isDeleted=TRUE)(cn=*))"
        );
    }
}
