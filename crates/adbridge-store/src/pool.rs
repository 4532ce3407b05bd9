//! SQLite connection handling for the state store
//!
//! The bridge has one writer (the sync worker) and a handful of readers
//! (the control surface serving status and event-log queries), so the
//! file-backed pool runs in WAL mode: readers never block the worker's
//! write bursts, and the busy timeout rides out the sync/push interleave.
//! SQLite leaves foreign-key enforcement off unless each connection opts
//! in, so the connect options turn it on for every connection.
//!
//! The schema migration is embedded and executed when the pool comes up;
//! a fresh database file is usable immediately.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::StoreError;

/// Connections for the file-backed pool
const MAX_CONNECTIONS: u32 = 5;

/// How long a connection waits on a locked database before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const INITIAL_MIGRATION: &str = include_str!("migrations/0001_initial.sql");

/// Owns the SQLite connection pool backing [`crate::SqliteStore`]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens (creating if needed) the database file at `db_path`, including
    /// any missing parent directories, and brings the schema up to date.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` when the file or its
    /// directory cannot be opened, `StoreError::MigrationFailed` when the
    /// schema migration fails.
    pub async fn new(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::ConnectionFailed(format!(
                    "Cannot create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = Self::build(options, SqlitePoolOptions::new().max_connections(MAX_CONNECTIONS))
            .await?;

        tracing::info!(path = %db_path.display(), "Database pool initialized");
        Ok(Self { pool })
    }

    /// Opens an in-memory database for tests.
    ///
    /// An in-memory SQLite database lives and dies with its connection, so
    /// the pool is pinned to exactly one connection that is never retired.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);

        let pool_options = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);

        let pool = Self::build(options, pool_options).await?;

        tracing::debug!("In-memory database pool initialized");
        Ok(Self { pool })
    }

    /// Returns a reference to the underlying SQLite connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Connects with the given options and applies the embedded schema
    async fn build(
        options: SqliteConnectOptions,
        pool_options: SqlitePoolOptions,
    ) -> Result<SqlitePool, StoreError> {
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(format!("Cannot open database: {e}")))?;

        sqlx::raw_sql(INITIAL_MIGRATION)
            .execute(&pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("Schema migration failed: {e}")))?;

        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_pool_has_migrated_schema() {
        let pool = DatabasePool::in_memory().await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM active_directory_user")
            .fetch_one(pool.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_foreign_key_enforcement_is_on() {
        let pool = DatabasePool::in_memory().await.unwrap();
        let (enabled,): (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(pool.pool())
            .await
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[tokio::test]
    async fn test_file_pool_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("state.db");

        let pool = DatabasePool::new(&db_path).await.unwrap();
        assert!(db_path.exists());

        // The migration ran on the fresh file too
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM active_directory_event")
            .fetch_one(pool.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
