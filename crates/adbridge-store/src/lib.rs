//! Local SQLite state store for AdBridge
//!
//! Concrete implementation of the [`IStore`](adbridge_core::ports::IStore)
//! port: a pooled SQLite database holding forests, controller memberships,
//! users, groups, memberships, per-controller sync contexts, the event log
//! and user avatars. The forest-configuration apply runs inside a single
//! transaction so a failed edit script never leaves a half-applied
//! configuration behind.

pub mod pool;
pub mod repository;

pub use pool::DatabasePool;
pub use repository::SqliteStore;

use thiserror::Error;

/// Errors produced by the store adapter
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to open or create the database
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    /// Schema migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// A value could not be converted between its domain and SQL forms
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Query execution failed
    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),
}
