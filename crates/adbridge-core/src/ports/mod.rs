//! Port traits (driven/secondary ports)
//!
//! The engine talks to the outside world exclusively through these traits:
//! [`directory::IDirectoryClient`] for the LDAP side and
//! [`store::IStore`] for the local cache database.

pub mod directory;
pub mod store;

pub use directory::{
    DirectoryError, DirectoryServerInfo, ExtendedBindError, IDirectoryClient, IEntityPages,
};
pub use store::IStore;
