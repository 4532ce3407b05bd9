//! Domain model for AdBridge
//!
//! The entities here fall into three groups:
//!
//! - **Configuration entities**: [`Forest`] and [`DomainController`] describe
//!   what to sync and where to reach it.
//! - **Directory entities**: [`AdEntity`], [`AdUser`] and [`AdGroup`] are
//!   transient copies of what the directory returned during enumeration.
//! - **Persisted overlays**: [`DbUser`] and [`DbGroup`] wrap a directory
//!   entity with the push bookkeeping the cloud side needs (`qliqId`,
//!   sent/error flags, presence status).

pub mod changes;
pub mod entity;
pub mod errors;
pub mod event;
pub mod forest;
pub mod newtypes;
pub mod overlay;
pub mod status;
pub mod sync_context;

pub use changes::{DomainControllerChange, DomainControllerWithChange, ForestChanges, ForestWithChange};
pub use entity::{AdEntity, AdGroup, AdUser, ValidState};
pub use errors::DomainError;
pub use event::{Event, EventCategory, EventType};
pub use forest::{Credentials, DomainController, Forest};
pub use newtypes::ObjectGuid;
pub use overlay::{AdStatus, DbGroup, DbUser, DbUserAvatar, PushState};
pub use status::{ProgressAndStatus, SyncStatusSnapshot};
pub use sync_context::SyncContext;
