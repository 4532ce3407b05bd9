//! Live progress and status snapshots for observers
//!
//! The snapshot is what the control surface serializes for the operator UI.
//! Each progress value uses `maximum = -1` to denote "indeterminate".

use serde::{Deserialize, Serialize};

/// One progress bar: current value, maximum (-1 = indeterminate) and a
/// human-readable description of what is happening
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressAndStatus {
    pub value: i32,
    pub maximum: i32,
    pub text: String,
}

impl Default for ProgressAndStatus {
    fn default() -> Self {
        Self {
            value: 0,
            maximum: -1,
            text: String::new(),
        }
    }
}

impl ProgressAndStatus {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_indeterminate(&self) -> bool {
        self.maximum < 0
    }
}

/// Snapshot of the whole engine state as exposed over RPC
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusSnapshot {
    pub is_ad_sync_in_progress: bool,
    pub is_web_push_in_progress: bool,
    pub web_push_progress: ProgressAndStatus,
    pub ad_sync_progress: ProgressAndStatus,
    pub is_anomaly_detected: bool,
    pub anomaly_message: String,
    pub anomaly_not_present_user_count: i64,
    pub anomaly_not_present_group_count: i64,
}

impl SyncStatusSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_indeterminate() {
        let progress = ProgressAndStatus::default();
        assert!(progress.is_indeterminate());
        assert_eq!(progress.value, 0);
    }

    #[test]
    fn test_snapshot_json_keys() {
        let snapshot = SyncStatusSnapshot {
            is_ad_sync_in_progress: true,
            anomaly_message: "paused".to_string(),
            ..SyncStatusSnapshot::default()
        };
        let json = snapshot.to_json();
        assert!(json.contains("\"isAdSyncInProgress\":true"));
        assert!(json.contains("\"anomalyNotPresentUserCount\":0"));
        assert!(json.contains("\"webPushProgress\""));
    }
}
