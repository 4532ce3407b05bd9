//! Forest and domain controller configuration entities
//!
//! A [`Forest`] is the unit of administrative trust: service-account
//! credentials, the name of the directory main group whose transitive
//! subgroups define the synced population, and one or more
//! [`DomainController`] endpoints, exactly one of which is primary.

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::ObjectGuid;

/// A reachable directory server endpoint belonging to a forest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainController {
    /// Host name or address as configured by the operator
    pub host: String,
    /// Fully qualified DNS name, resolved lazily on the first successful
    /// reachability probe and persisted afterwards
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dns_name: String,
    /// Whether this controller is tried first
    #[serde(default)]
    pub is_primary: bool,
}

impl DomainController {
    /// Creates a controller with just a host
    pub fn new(host: impl Into<String>, is_primary: bool) -> Self {
        Self {
            host: host.into(),
            dns_name: String::new(),
            is_primary,
        }
    }
}

/// Service-account credentials used to bind to a forest's controllers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user_name: String,
    pub password: String,
    /// Controller host the bind is directed at
    pub host: String,
}

/// A forest configuration entry
///
/// Invariants (enforced by [`Forest::validate`]):
/// - non-empty `objectGuid`
/// - at least one domain controller
/// - exactly one primary controller (ties broken by input order)
/// - no duplicate controller hosts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forest {
    /// Stable opaque identity of this configuration entry
    #[serde(rename = "objectGuid")]
    pub object_guid: ObjectGuid,
    /// Service account user name
    #[serde(rename = "userName")]
    pub user_name: String,
    /// Service account password
    pub password: String,
    /// Name of the directory main group to sync
    #[serde(rename = "syncGroup")]
    pub sync_group: String,
    /// Ordered controller list; the primary is tried first
    #[serde(rename = "domainControllers")]
    pub domain_controllers: Vec<DomainController>,
}

impl Forest {
    /// Checks all forest invariants, returning the first violation found
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.sync_group.trim().is_empty() {
            return Err(DomainError::InvalidForest(format!(
                "forest {} has no sync group configured",
                self.object_guid
            )));
        }
        if self.user_name.trim().is_empty() {
            return Err(DomainError::InvalidForest(format!(
                "forest {} has no service account user name",
                self.object_guid
            )));
        }
        if self.domain_controllers.is_empty() {
            return Err(DomainError::InvalidForest(format!(
                "forest {} has no domain controllers",
                self.object_guid
            )));
        }

        let mut seen_hosts = std::collections::HashSet::new();
        for dc in &self.domain_controllers {
            if dc.host.trim().is_empty() {
                return Err(DomainError::InvalidForest(format!(
                    "forest {} has a domain controller with an empty host",
                    self.object_guid
                )));
            }
            if !seen_hosts.insert(dc.host.as_str()) {
                return Err(DomainError::InvalidForest(format!(
                    "forest {} lists domain controller '{}' more than once",
                    self.object_guid, dc.host
                )));
            }
        }

        if self.domain_controllers.iter().filter(|dc| dc.is_primary).count() == 0 {
            return Err(DomainError::InvalidForest(format!(
                "forest {} has no primary domain controller",
                self.object_guid
            )));
        }

        Ok(())
    }

    /// Normalizes the primary flag: the first controller flagged primary
    /// wins, any later ones are demoted
    pub fn normalize_primary(&mut self) {
        let mut primary_seen = false;
        for dc in &mut self.domain_controllers {
            if dc.is_primary {
                if primary_seen {
                    dc.is_primary = false;
                } else {
                    primary_seen = true;
                }
            }
        }
    }

    /// Reorders controllers so the primary comes first, preserving the
    /// stored order among the additional controllers
    pub fn sort_controllers_primary_first(&mut self) {
        self.domain_controllers
            .sort_by_key(|dc| if dc.is_primary { 0 } else { 1 });
    }

    /// Credentials for binding to the given controller of this forest
    pub fn credentials_for(&self, controller: &DomainController) -> Credentials {
        Credentials {
            user_name: self.user_name.clone(),
            password: self.password.clone(),
            host: controller.host.clone(),
        }
    }

    /// Serializes to the wire map representation used by the control surface
    pub fn to_map(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    /// Deserializes from the wire map representation
    pub fn from_map(map: serde_json::Map<String, serde_json::Value>) -> Result<Self, DomainError> {
        serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| DomainError::ValidationFailed(format!("cannot parse forest map: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_forest() -> Forest {
        Forest {
            object_guid: ObjectGuid::new("F1").unwrap(),
            user_name: "svc-sync".to_string(),
            password: "secret".to_string(),
            sync_group: "qliqConnect".to_string(),
            domain_controllers: vec![
                DomainController::new("dc1", true),
                DomainController::new("dc2", false),
            ],
        }
    }

    #[test]
    fn test_valid_forest_passes() {
        assert!(valid_forest().validate().is_ok());
    }

    #[test]
    fn test_requires_sync_group() {
        let mut f = valid_forest();
        f.sync_group = " ".to_string();
        assert!(f.validate().is_err());
    }

    #[test]
    fn test_requires_controllers() {
        let mut f = valid_forest();
        f.domain_controllers.clear();
        assert!(f.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_hosts() {
        let mut f = valid_forest();
        f.domain_controllers.push(DomainController::new("dc1", false));
        assert!(f.validate().is_err());
    }

    #[test]
    fn test_requires_a_primary() {
        let mut f = valid_forest();
        for dc in &mut f.domain_controllers {
            dc.is_primary = false;
        }
        assert!(f.validate().is_err());
    }

    #[test]
    fn test_normalize_primary_first_wins() {
        let mut f = valid_forest();
        f.domain_controllers[1].is_primary = true;
        f.normalize_primary();
        assert!(f.domain_controllers[0].is_primary);
        assert!(!f.domain_controllers[1].is_primary);
    }

    #[test]
    fn test_sort_primary_first() {
        let mut f = Forest {
            domain_controllers: vec![
                DomainController::new("dc2", false),
                DomainController::new("dc3", false),
                DomainController::new("dc1", true),
            ],
            ..valid_forest()
        };
        f.sort_controllers_primary_first();
        assert_eq!(f.domain_controllers[0].host, "dc1");
        assert_eq!(f.domain_controllers[1].host, "dc2");
        assert_eq!(f.domain_controllers[2].host, "dc3");
    }

    #[test]
    fn test_map_round_trip() {
        let forest = valid_forest();
        let map = forest.to_map();
        assert_eq!(map["objectGuid"], "F1");
        assert_eq!(map["syncGroup"], "qliqConnect");
        let back = Forest::from_map(map).unwrap();
        assert_eq!(back, forest);
    }
}
