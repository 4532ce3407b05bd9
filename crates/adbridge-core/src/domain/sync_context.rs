//! Per-controller sync watermark state
//!
//! One [`SyncContext`] row exists per `(forestGuid, controllerHost)` pair.
//! The pair `(invocationId, highestCommittedUSN)` anchors the next delta
//! sync; any change of `invocationId` invalidates the accumulated watermark.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Watermark and identity state for one forest/controller pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncContext {
    pub forest_guid: String,
    pub dc_host: String,
    /// Directory server instance identifier; a change forces a full sync
    pub invocation_id: String,
    /// Highest USN committed by the server at the last successful cycle.
    /// Empty means this pair never completed a sync.
    pub highest_committed_usn: String,
    /// When the last full sync completed; `None` forces a full sync, and a
    /// value from a previous calendar day forces one too
    pub last_full_sync: Option<DateTime<Utc>>,
    /// Cached resolved DNS name of the controller
    pub dc_dns_name: String,
}

impl SyncContext {
    pub fn new(forest_guid: impl Into<String>, dc_host: impl Into<String>) -> Self {
        Self {
            forest_guid: forest_guid.into(),
            dc_host: dc_host.into(),
            ..Self::default()
        }
    }

    /// Whether this pair ever completed a successful sync
    pub fn has_synced(&self) -> bool {
        !self.highest_committed_usn.is_empty()
    }

    /// Numeric value of the watermark, when parseable
    pub fn usn_value(&self) -> Option<i64> {
        self.highest_committed_usn.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_context_never_synced() {
        let ctx = SyncContext::new("F1", "dc1");
        assert!(!ctx.has_synced());
        assert!(ctx.usn_value().is_none());
        assert!(ctx.last_full_sync.is_none());
    }

    #[test]
    fn test_usn_value() {
        let mut ctx = SyncContext::new("F1", "dc1");
        ctx.highest_committed_usn = "12345".to_string();
        assert!(ctx.has_synced());
        assert_eq!(ctx.usn_value(), Some(12345));
    }
}
