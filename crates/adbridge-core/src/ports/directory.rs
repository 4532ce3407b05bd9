//! Directory client port (driven/secondary port)
//!
//! The engine consumes the directory through pull-based paged searches.
//! An `open_*` call performs the authenticated rebind against the
//! directory root, reads the server identity attributes (`DnsHostName`,
//! `invocationId`, `highestCommittedUSN`, `defaultNamingContext`),
//! reconciles them with the caller's [`SyncContext`] and returns a page
//! stream sorted by `uSNChanged` ascending. Dropping the stream abandons
//! the underlying search.
//!
//! ## Watermark contract
//!
//! - The lower-bound USN of a search is the context's
//!   `highest_committed_usn`; an empty value means "from zero" (full).
//! - If the observed `DnsHostName` or `invocationId` differ from the
//!   context, the implementation must treat the lower bound as zero: the
//!   accumulated watermark belongs to a different server instance.
//! - After a successful open the context carries the server-observed
//!   watermark; the caller decides whether to persist it (only after the
//!   whole cycle completed).

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entity::{AdGroup, AdUser};
use crate::domain::forest::Credentials;
use crate::domain::sync_context::SyncContext;

/// Extended bind failure detail parsed from the directory's error data
///
/// `symbolic` is a stable machine-readable name such as `invalid-password`
/// or `account-locked`; `code` is the raw sub-code the directory reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedBindError {
    pub code: u32,
    pub message: String,
    pub symbolic: String,
}

/// Errors surfaced by directory operations
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The bind was rejected; carries the parsed extended sub-code when the
    /// server provided one
    #[error("Invalid credentials: {}", .0.message)]
    InvalidCredentials(ExtendedBindError),

    /// The server did not answer the bind at all
    #[error("Directory server unreachable: {0}")]
    ServerUnreachable(String),

    /// The caller-supplied filter was rejected before being sent
    #[error("Invalid search filter: {0}")]
    InvalidFilter(String),

    /// Any other protocol-level failure
    #[error("Directory protocol error: {0}")]
    Protocol(String),
}

/// Identity attributes read from the directory root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryServerInfo {
    pub dns_host_name: String,
    pub invocation_id: String,
    pub highest_committed_usn: String,
    pub default_naming_context: String,
}

/// A paged stream of directory entries
///
/// `next_page` yields `Ok(None)` once the search is exhausted. The engine
/// polls its cooperative stop flag between pages and between entries;
/// dropping the stream releases the search on all exit paths.
#[async_trait]
pub trait IEntityPages<T>: Send {
    async fn next_page(&mut self) -> Result<Option<Vec<T>>, DirectoryError>;
}

/// Port trait for the directory side of the bridge
#[async_trait]
pub trait IDirectoryClient: Send + Sync {
    /// Binds to the server named in the credentials and reads the root
    /// identity attributes. This is the reachability probe the controller
    /// selection uses; the returned `dns_host_name` is persisted on first
    /// success.
    async fn server_info(&self, credentials: &Credentials)
        -> Result<DirectoryServerInfo, DirectoryError>;

    /// Opens a paged group search. `filter` must start with `(` and must
    /// not mention `uSNChanged`; it is AND-joined with the USN lower bound
    /// derived from `ctx`.
    async fn open_group_search(
        &self,
        credentials: &Credentials,
        page_size: u32,
        filter: &str,
        ctx: &mut SyncContext,
    ) -> Result<Box<dyn IEntityPages<AdGroup>>, DirectoryError>;

    /// Opens a paged user search with the same filter contract as
    /// [`Self::open_group_search`]. Avatar attributes are only requested
    /// when `include_avatars` is set.
    async fn open_user_search(
        &self,
        credentials: &Credentials,
        page_size: u32,
        filter: &str,
        ctx: &mut SyncContext,
        include_avatars: bool,
    ) -> Result<Box<dyn IEntityPages<AdUser>>, DirectoryError>;

    /// Opens a scan of the deleted-objects (tombstone) container, yielding
    /// the `objectGUID`s of deleted user entries newer than the context
    /// watermark.
    async fn open_deleted_user_search(
        &self,
        credentials: &Credentials,
        page_size: u32,
        ctx: &mut SyncContext,
    ) -> Result<Box<dyn IEntityPages<String>>, DirectoryError>;
}
