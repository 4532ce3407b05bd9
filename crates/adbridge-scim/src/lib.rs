//! SCIM cloud client for AdBridge
//!
//! A thin, typed REST client for the cloud identity provider's SCIM-style
//! surface (`/scimv2/Users`, `/scimv2/Groups`) plus the JSON payload
//! mapping between persisted rows and the provider's wire format.
//!
//! Error classification lives here because the pusher's retry/skip policy
//! depends on it: permanent errors (400, 404, 422) quarantine a row until
//! its directory data changes, network errors pause the whole push, and
//! everything else is transient.

pub mod client;
pub mod payload;

pub use client::{ScimClient, ScimResponse};
