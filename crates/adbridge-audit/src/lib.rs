//! Operator event log for AdBridge
//!
//! Wraps the store's event persistence with a logger that never lets an
//! audit failure break a sync decision: persistence errors are logged via
//! `tracing::warn!` and swallowed.
//!
//! Call-site provenance is captured by the [`ad_event!`] macro, which
//! records `file!()`/`line!()` into the structured log next to the
//! persisted event.

use std::sync::Arc;

use adbridge_core::domain::event::{Event, EventCategory, EventType};
use adbridge_core::ports::IStore;

/// Persists operator-visible events through the store, non-fatally.
#[derive(Clone)]
pub struct EventLogger {
    store: Arc<dyn IStore>,
}

impl EventLogger {
    pub fn new(store: Arc<dyn IStore>) -> Self {
        Self { store }
    }

    /// Persist an event, swallowing errors with a tracing warning.
    pub async fn log(&self, event_type: EventType, category: EventCategory, message: String) {
        self.log_at(event_type, category, message, "", 0).await;
    }

    /// Persist an event with explicit call-site provenance. Invoked through
    /// the [`ad_event!`] macro rather than directly.
    pub async fn log_at(
        &self,
        event_type: EventType,
        category: EventCategory,
        message: String,
        file: &'static str,
        line: u32,
    ) {
        match category {
            EventCategory::Error => {
                tracing::error!(kind = event_type.as_str(), file, line, "{message}")
            }
            EventCategory::Warning => {
                tracing::warn!(kind = event_type.as_str(), file, line, "{message}")
            }
            EventCategory::Info => {
                tracing::info!(kind = event_type.as_str(), file, line, "{message}")
            }
        }

        let event = Event::new(event_type, category, message);
        if let Err(e) = self.store.insert_event(&event).await {
            tracing::warn!(error = %e, "Failed to persist event log entry");
        }
    }

    /// Event page as a JSON array string, newest first.
    pub async fn page_as_json(&self, offset: i64, count: i64) -> String {
        match self.store.events_page(offset, count).await {
            Ok(events) => serde_json::to_string(&events).unwrap_or_else(|_| "[]".to_string()),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load event log page");
                "[]".to_string()
            }
        }
    }
}

/// Logs and persists an operator event, capturing the call site.
///
/// ```ignore
/// ad_event!(events, EventType::Sync, EventCategory::Info,
///     "Full sync started for main group: {group}").await;
/// ```
#[macro_export]
macro_rules! ad_event {
    ($logger:expr, $etype:expr, $category:expr, $($arg:tt)+) => {
        $logger.log_at($etype, $category, format!($($arg)+), file!(), line!())
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use adbridge_store::{DatabasePool, SqliteStore};

    async fn logger_with_store() -> (EventLogger, Arc<dyn IStore>) {
        let pool = DatabasePool::in_memory().await.unwrap();
        let store: Arc<dyn IStore> = Arc::new(SqliteStore::new(pool.pool().clone()));
        (EventLogger::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_log_persists_event() {
        let (logger, store) = logger_with_store().await;
        logger
            .log(
                EventType::Sync,
                EventCategory::Info,
                "Active Directory sync completed".to_string(),
            )
            .await;

        let events = store.events_page(0, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Sync);
        assert_eq!(events[0].category, EventCategory::Info);
        assert_eq!(events[0].message, "Active Directory sync completed");
    }

    #[tokio::test]
    async fn test_macro_formats_and_persists() {
        let (logger, store) = logger_with_store().await;
        let missing = 42;
        ad_event!(
            logger,
            EventType::WebPush,
            EventCategory::Warning,
            "Pushed {missing} user changes to the cloud"
        )
        .await;

        let events = store.events_page(0, 10).await.unwrap();
        assert_eq!(events[0].message, "Pushed 42 user changes to the cloud");
        assert_eq!(events[0].event_type, EventType::WebPush);
    }

    #[tokio::test]
    async fn test_page_as_json() {
        let (logger, _store) = logger_with_store().await;
        logger
            .log(EventType::Auth, EventCategory::Error, "bind failed".to_string())
            .await;

        let json = logger.page_as_json(0, 10).await;
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["message"], "bind failed");
        assert_eq!(parsed[0]["type"], "auth");
    }
}
