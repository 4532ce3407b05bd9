//! Domain newtypes with validation
//!
//! Identifiers that must never be empty are wrapped so the invariant is
//! checked once, at construction time.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// Directory object GUID, the primary identity of every synced entity
///
/// The directory reports these as formatted GUID strings. They are treated
/// as opaque: the only invariant enforced here is non-emptiness, because an
/// empty `objectGuid` means a corrupted record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectGuid(String);

impl ObjectGuid {
    /// Wraps a GUID string, rejecting empty input
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::InvalidId("empty objectGuid".to_string()));
        }
        Ok(Self(value))
    }

    /// Returns the GUID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ObjectGuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObjectGuid {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ObjectGuid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty() {
        assert!(ObjectGuid::new("").is_err());
        assert!(ObjectGuid::new("   ").is_err());
    }

    #[test]
    fn test_accepts_guid_string() {
        let guid = ObjectGuid::new("c9c56a12-7d58-4a0b-9f4d-3f6e0d6b2a11").unwrap();
        assert_eq!(guid.as_str(), "c9c56a12-7d58-4a0b-9f4d-3f6e0d6b2a11");
    }

    #[test]
    fn test_serde_transparent() {
        let guid = ObjectGuid::new("F1").unwrap();
        let json = serde_json::to_string(&guid).unwrap();
        assert_eq!(json, "\"F1\"");
        let back: ObjectGuid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, guid);
    }
}
