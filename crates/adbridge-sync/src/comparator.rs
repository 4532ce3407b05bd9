//! Forest configuration comparator
//!
//! Diffs the previous forest set against the new one and produces a
//! structured change list. The list is an edit script: replaying it on an
//! empty store yields the same state as applying the final configuration
//! directly, which is what makes the transactional apply safe.
//!
//! Matching is by `objectGuid` for forests and by `host` for controllers.
//! The new set is walked in input order; whatever remains of the previous
//! set afterwards is emitted as deletions.

use std::collections::HashMap;

use adbridge_core::domain::changes::{
    DomainControllerChange, DomainControllerWithChange, ForestChanges, ForestWithChange,
};
use adbridge_core::domain::forest::{DomainController, Forest};
use tracing::warn;

pub struct ForestComparator;

impl ForestComparator {
    /// Compares two forest sets; returns only the forests that changed.
    /// An empty result means the configurations are equivalent.
    pub fn compare(previous: &[Forest], current: &[Forest]) -> Vec<ForestWithChange> {
        let mut previous_by_guid: HashMap<&str, &Forest> = previous
            .iter()
            .map(|f| (f.object_guid.as_str(), f))
            .collect();

        let mut changes = Vec::new();
        for forest in current {
            let prior = previous_by_guid.remove(forest.object_guid.as_str());
            let mut dc_changes = Vec::new();
            let mask = Self::compare_forest(prior, forest, &mut dc_changes);
            if !mask.is_empty() {
                changes.push(ForestWithChange {
                    forest: forest.clone(),
                    changes: mask,
                    domain_controller_changes: dc_changes,
                });
            }
        }

        // Whatever is left of the previous set was deleted
        for forest in previous.iter() {
            if !previous_by_guid.contains_key(forest.object_guid.as_str()) {
                continue;
            }
            let mut mask = ForestChanges::DELETED;
            let mut dc_changes = Vec::new();
            if Self::push_deleted_controllers(&forest.domain_controllers, &mut dc_changes) {
                mask.insert(ForestChanges::DOMAIN_CONTROLLER_DELETED);
            }
            changes.push(ForestWithChange {
                forest: forest.clone(),
                changes: mask,
                domain_controller_changes: dc_changes,
            });
        }

        changes
    }

    fn compare_forest(
        previous: Option<&Forest>,
        current: &Forest,
        dc_changes: &mut Vec<DomainControllerWithChange>,
    ) -> ForestChanges {
        let mut mask = ForestChanges::NOT_CHANGED;

        match previous {
            None => mask.insert(ForestChanges::ADDED),
            Some(previous) => {
                debug_assert_eq!(previous.object_guid, current.object_guid);
                if previous.user_name != current.user_name || previous.password != current.password
                {
                    mask.insert(ForestChanges::CREDENTIALS_CHANGED);
                }
                if previous.sync_group != current.sync_group {
                    mask.insert(ForestChanges::SYNC_GROUP_CHANGED);
                }
            }
        }

        let mut previous_by_host: HashMap<&str, &DomainController> = previous
            .map(|f| {
                f.domain_controllers
                    .iter()
                    .map(|dc| (dc.host.as_str(), dc))
                    .collect()
            })
            .unwrap_or_default();

        for dc in &current.domain_controllers {
            if dc.host.is_empty() {
                warn!("Domain controller with empty host in current forest");
                continue;
            }
            match previous_by_host.remove(dc.host.as_str()) {
                Some(previous_dc) => {
                    if previous_dc.is_primary != dc.is_primary {
                        dc_changes.push(DomainControllerWithChange {
                            domain_controller: dc.clone(),
                            change: DomainControllerChange::IsPrimaryChanged,
                        });
                        mask.insert(ForestChanges::DOMAIN_CONTROLLER_CHANGED);
                    }
                }
                None => {
                    dc_changes.push(DomainControllerWithChange {
                        domain_controller: dc.clone(),
                        change: DomainControllerChange::Added,
                    });
                    mask.insert(ForestChanges::DOMAIN_CONTROLLER_ADDED);
                }
            }
        }

        let survivors: Vec<DomainController> =
            previous_by_host.into_values().cloned().collect();
        if Self::push_deleted_controllers(&survivors, dc_changes) {
            mask.insert(ForestChanges::DOMAIN_CONTROLLER_DELETED);
        }

        mask
    }

    fn push_deleted_controllers(
        controllers: &[DomainController],
        dc_changes: &mut Vec<DomainControllerWithChange>,
    ) -> bool {
        let mut any = false;
        for dc in controllers {
            if dc.host.is_empty() {
                warn!("Domain controller with empty host in previous forest");
                continue;
            }
            dc_changes.push(DomainControllerWithChange {
                domain_controller: dc.clone(),
                change: DomainControllerChange::Deleted,
            });
            any = true;
        }
        any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adbridge_core::domain::newtypes::ObjectGuid;

    fn forest(guid: &str, hosts: &[(&str, bool)]) -> Forest {
        Forest {
            object_guid: ObjectGuid::new(guid).unwrap(),
            user_name: "svc".to_string(),
            password: "pw".to_string(),
            sync_group: "qliqConnect".to_string(),
            domain_controllers: hosts
                .iter()
                .map(|(host, primary)| DomainController::new(*host, *primary))
                .collect(),
        }
    }

    #[test]
    fn test_no_change_yields_empty_list() {
        let forests = vec![forest("F1", &[("dc1", true)])];
        assert!(ForestComparator::compare(&forests, &forests).is_empty());
    }

    #[test]
    fn test_added_forest_adds_all_controllers() {
        let current = vec![forest("F1", &[("dc1", true), ("dc2", false)])];
        let changes = ForestComparator::compare(&[], &current);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].changes.contains(ForestChanges::ADDED));
        assert!(changes[0].changes.contains(ForestChanges::DOMAIN_CONTROLLER_ADDED));
        assert_eq!(changes[0].domain_controller_changes.len(), 2);
        assert!(changes[0]
            .domain_controller_changes
            .iter()
            .all(|c| c.change == DomainControllerChange::Added));
    }

    #[test]
    fn test_deleted_forest_deletes_all_controllers() {
        let previous = vec![forest("F1", &[("dc1", true)]), forest("F2", &[("dc2", true)])];
        let current = vec![forest("F1", &[("dc1", true)])];
        let changes = ForestComparator::compare(&previous, &current);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].forest.object_guid.as_str(), "F2");
        assert!(changes[0].changes.contains(ForestChanges::DELETED));
        assert!(changes[0].changes.contains(ForestChanges::DOMAIN_CONTROLLER_DELETED));
        assert_eq!(
            changes[0].domain_controller_changes[0].change,
            DomainControllerChange::Deleted
        );
    }

    #[test]
    fn test_credentials_change_detected() {
        let previous = vec![forest("F1", &[("dc1", true)])];
        let mut updated = forest("F1", &[("dc1", true)]);
        updated.password = "rotated".to_string();
        let changes = ForestComparator::compare(&previous, &[updated]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].changes, ForestChanges::CREDENTIALS_CHANGED);
        assert!(changes[0].domain_controller_changes.is_empty());
    }

    #[test]
    fn test_sync_group_change_detected() {
        let previous = vec![forest("F1", &[("dc1", true)])];
        let mut updated = forest("F1", &[("dc1", true)]);
        updated.sync_group = "otherGroup".to_string();
        let changes = ForestComparator::compare(&previous, &[updated]);
        assert_eq!(changes[0].changes, ForestChanges::SYNC_GROUP_CHANGED);
    }

    #[test]
    fn test_controller_add_remove_and_primary_flip() {
        let previous = vec![forest("F1", &[("dc1", true), ("dc2", false)])];
        let current = vec![forest("F1", &[("dc1", false), ("dc3", true)])];
        let changes = ForestComparator::compare(&previous, &current);
        assert_eq!(changes.len(), 1);
        let mask = changes[0].changes;
        assert!(mask.contains(ForestChanges::DOMAIN_CONTROLLER_ADDED));
        assert!(mask.contains(ForestChanges::DOMAIN_CONTROLLER_CHANGED));
        assert!(mask.contains(ForestChanges::DOMAIN_CONTROLLER_DELETED));

        let by_change = |change: DomainControllerChange| {
            changes[0]
                .domain_controller_changes
                .iter()
                .filter(|c| c.change == change)
                .map(|c| c.domain_controller.host.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(by_change(DomainControllerChange::Added), vec!["dc3"]);
        assert_eq!(by_change(DomainControllerChange::IsPrimaryChanged), vec!["dc1"]);
        assert_eq!(by_change(DomainControllerChange::Deleted), vec!["dc2"]);
    }

    #[test]
    fn test_multiple_changes_combine() {
        let previous = vec![forest("F1", &[("dc1", true)])];
        let mut updated = forest("F1", &[("dc1", true)]);
        updated.user_name = "svc2".to_string();
        updated.sync_group = "newGroup".to_string();
        let changes = ForestComparator::compare(&previous, &[updated]);
        let mask = changes[0].changes;
        assert!(mask.contains(ForestChanges::CREDENTIALS_CHANGED));
        assert!(mask.contains(ForestChanges::SYNC_GROUP_CHANGED));
    }
}
