//! Structured change lists produced by the forest comparator
//!
//! A configuration diff is an edit script: replaying it on an empty store
//! yields the same state as applying the final configuration directly.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::forest::{DomainController, Forest};

/// Bit mask of changes detected on a forest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForestChanges(u32);

impl ForestChanges {
    pub const NOT_CHANGED: ForestChanges = ForestChanges(0);
    pub const ADDED: ForestChanges = ForestChanges(1 << 0);
    pub const DELETED: ForestChanges = ForestChanges(1 << 1);
    pub const CREDENTIALS_CHANGED: ForestChanges = ForestChanges(1 << 2);
    pub const DOMAIN_CONTROLLER_ADDED: ForestChanges = ForestChanges(1 << 3);
    pub const DOMAIN_CONTROLLER_CHANGED: ForestChanges = ForestChanges(1 << 4);
    pub const DOMAIN_CONTROLLER_DELETED: ForestChanges = ForestChanges(1 << 5);
    pub const SYNC_GROUP_CHANGED: ForestChanges = ForestChanges(1 << 6);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: ForestChanges) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ForestChanges) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for ForestChanges {
    type Output = ForestChanges;

    fn bitor(self, rhs: ForestChanges) -> ForestChanges {
        ForestChanges(self.0 | rhs.0)
    }
}

impl fmt::Display for ForestChanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (ForestChanges::ADDED, "Added"),
            (ForestChanges::DELETED, "Deleted"),
            (ForestChanges::CREDENTIALS_CHANGED, "CredentialsChanged"),
            (ForestChanges::DOMAIN_CONTROLLER_ADDED, "DomainControllerAdded"),
            (ForestChanges::DOMAIN_CONTROLLER_CHANGED, "DomainControllerChanged"),
            (ForestChanges::DOMAIN_CONTROLLER_DELETED, "DomainControllerDeleted"),
            (ForestChanges::SYNC_GROUP_CHANGED, "SyncGroupChanged"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    write!(f, " ")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "NotChanged")?;
        }
        Ok(())
    }
}

/// What happened to one domain controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainControllerChange {
    Added,
    Deleted,
    IsPrimaryChanged,
}

/// A controller paired with its detected change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainControllerWithChange {
    pub domain_controller: DomainController,
    pub change: DomainControllerChange,
}

/// A forest paired with its change mask and per-controller changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForestWithChange {
    pub forest: Forest,
    pub changes: ForestChanges,
    pub domain_controller_changes: Vec<DomainControllerWithChange>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_operations() {
        let mut changes = ForestChanges::NOT_CHANGED;
        assert!(changes.is_empty());

        changes.insert(ForestChanges::CREDENTIALS_CHANGED);
        changes.insert(ForestChanges::SYNC_GROUP_CHANGED);
        assert!(changes.contains(ForestChanges::CREDENTIALS_CHANGED));
        assert!(changes.contains(ForestChanges::SYNC_GROUP_CHANGED));
        assert!(!changes.contains(ForestChanges::DELETED));
    }

    #[test]
    fn test_display() {
        assert_eq!(ForestChanges::NOT_CHANGED.to_string(), "NotChanged");
        let combo = ForestChanges::ADDED | ForestChanges::DOMAIN_CONTROLLER_ADDED;
        assert_eq!(combo.to_string(), "Added DomainControllerAdded");
    }
}
