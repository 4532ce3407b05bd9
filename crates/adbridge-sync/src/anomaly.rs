//! Mass-deletion anomaly guard
//!
//! A cycle in which the count of newly-missing users crosses the
//! configured threshold does not delete anything on the cloud. The first
//! such cycle arms the guard; a second consecutive one latches it and
//! pauses the engine until the operator resumes. A cycle below the
//! threshold while armed self-heals back to normal.

use std::sync::Arc;

use adbridge_core::config::AnomalyConfig;
use adbridge_core::domain::overlay::AdStatus;
use adbridge_core::ports::IStore;

/// Guard state across consecutive sync cycles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AnomalyStatus {
    #[default]
    NoAnomaly,
    FirstSeenAnomaly,
    PersistentAnomaly,
}

/// What one evaluation concluded
#[derive(Debug, Default)]
pub struct AnomalyOutcome {
    /// Error-category message to log when the guard armed or latched
    pub anomaly_message: Option<String>,
    /// Warning-category message to log when an armed guard self-healed
    pub self_heal_message: Option<String>,
}

/// Detects suspicious mass disappearance of users between runs
pub struct AnomalyDetector {
    status: AnomalyStatus,
    /// Present-user count recorded when the guard first armed
    initial_present_count: i64,
    not_present_users: i64,
    not_present_groups: i64,
    /// Operator-facing message while the guard is latched
    message: String,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self {
            status: AnomalyStatus::NoAnomaly,
            initial_present_count: 0,
            not_present_users: 0,
            not_present_groups: 0,
            message: String::new(),
        }
    }

    pub fn status(&self) -> AnomalyStatus {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn not_present_users(&self) -> i64 {
        self.not_present_users
    }

    pub fn not_present_groups(&self) -> i64 {
        self.not_present_groups
    }

    /// Clears the guard entirely (operator action or clean resume)
    pub fn clear(&mut self) {
        self.status = AnomalyStatus::NoAnomaly;
        self.initial_present_count = 0;
        self.not_present_users = 0;
        self.not_present_groups = 0;
        self.message.clear();
    }

    /// Resets the missing-user count after a cycle with no deletions
    pub fn reset_not_present_users(&mut self) {
        self.not_present_users = 0;
    }

    /// Forces the status back to normal without touching counters; used
    /// when detection is disabled but the guard is not latched
    pub fn reset_status_if_not_persistent(&mut self) {
        if self.status != AnomalyStatus::PersistentAnomaly {
            self.status = AnomalyStatus::NoAnomaly;
        }
    }

    /// Evaluates one finished forest cycle.
    ///
    /// `deleted_this_cycle` is the number of users this cycle marked
    /// deleted; `present_before` is the Present count at cycle start.
    /// While the guard is armed the missing count is recomputed from the
    /// store as "NotPresent and not yet sent", which measures the newly
    /// missing population rather than any residual backlog.
    pub async fn evaluate(
        &mut self,
        config: &AnomalyConfig,
        store: &Arc<dyn IStore>,
        deleted_this_cycle: i64,
        present_before: i64,
        groups_deleted_this_cycle: i64,
    ) -> anyhow::Result<AnomalyOutcome> {
        let mut outcome = AnomalyOutcome::default();

        let mut now_missing = deleted_this_cycle;
        let mut required_before = present_before;
        if self.status == AnomalyStatus::FirstSeenAnomaly {
            required_before = required_before.max(self.initial_present_count);
            now_missing = store
                .count_users_with_status_not_sent(AdStatus::NotPresent)
                .await?;
        }

        let percent_share =
            (required_before as f64 * f64::from(config.percent_threshold) / 100.0).ceil() as i64;
        let mut threshold = percent_share;
        if required_before >= config.user_count_threshold {
            threshold = config.user_count_threshold.max(threshold);
        }

        // Populations below the absolute floor are too small to judge
        if required_before >= threshold && threshold >= config.user_count_threshold {
            if now_missing >= threshold {
                match self.status {
                    AnomalyStatus::NoAnomaly => {
                        outcome.anomaly_message = Some(format!(
                            "Anomaly detected (initial), not present users: {now_missing}, \
                             previously present: {present_before}, threshold: {threshold}"
                        ));
                        self.status = AnomalyStatus::FirstSeenAnomaly;
                        self.initial_present_count = required_before;
                    }
                    AnomalyStatus::FirstSeenAnomaly => {
                        outcome.anomaly_message = Some(format!(
                            "Anomaly detected (second), not present users: {now_missing}, \
                             previously present: {present_before}, threshold: {threshold}"
                        ));
                        self.status = AnomalyStatus::PersistentAnomaly;
                        self.message = format!(
                            "The directory is missing {now_missing} users that were present \
                             during the previous sync. Deletion of these users from the cloud \
                             was paused. Review the directory and bridge configuration, then \
                             resume when the issue is resolved."
                        );
                    }
                    AnomalyStatus::PersistentAnomaly => {}
                }
            } else if self.status == AnomalyStatus::FirstSeenAnomaly {
                self.status = AnomalyStatus::NoAnomaly;
                outcome.self_heal_message = Some(format!(
                    "Initial anomaly cancelled, not present users: {now_missing}, previously \
                     present: {present_before}, threshold: {threshold}, present before initial \
                     anomaly: {}",
                    self.initial_present_count
                ));
            }
        }

        self.not_present_users = now_missing;
        self.not_present_groups = groups_deleted_this_cycle;
        Ok(outcome)
    }
}
