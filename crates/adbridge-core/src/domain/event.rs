//! Operator-visible event log entries
//!
//! Events are append-only and pruned by age at the start of each sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What subsystem produced the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Sync,
    WebPush,
    Auth,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Sync => "sync",
            EventType::WebPush => "web_push",
            EventType::Auth => "auth",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(EventType::Sync),
            "web_push" => Some(EventType::WebPush),
            "auth" => Some(EventType::Auth),
            _ => None,
        }
    }
}

/// Severity of the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventCategory {
    Info,
    Warning,
    Error,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Info => "info",
            EventCategory::Warning => "warning",
            EventCategory::Error => "error",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "info" => Some(EventCategory::Info),
            "warning" => Some(EventCategory::Warning),
            "error" => Some(EventCategory::Error),
            _ => None,
        }
    }
}

/// A single event log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Database row id, 0 before the entry is persisted
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub category: EventCategory,
    pub message: String,
}

impl Event {
    pub fn new(event_type: EventType, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            event_type,
            category,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
