//! LDAP directory adapter for AdBridge
//!
//! Implements the [`IDirectoryClient`](adbridge_core::ports::IDirectoryClient)
//! port on top of the `ldap3` protocol library:
//!
//! - root-DSE probing and invocation-id reconciliation (the watermark
//!   discipline that decides full vs. delta enumeration),
//! - USN-aware search filter composition with validation,
//! - paged searches with server-side sorting on `uSNChanged`,
//! - the tombstone-container scan behind the Show Deleted control,
//! - extended bind-error classification into stable symbolic names.

pub mod attrs;
pub mod bind_error;
pub mod client;
pub mod controls;
pub mod filter;

pub use client::LdapDirectoryClient;
