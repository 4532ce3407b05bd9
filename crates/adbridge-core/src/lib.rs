//! Core domain logic for AdBridge
//!
//! This crate contains the technology-agnostic heart of the identity
//! bridge: the domain model (forests, domain controllers, directory
//! entities and their persisted overlays), the typed configuration,
//! and the port traits implemented by the directory, store and cloud
//! adapters.
//!
//! No I/O happens here; everything observable lives behind the traits
//! in [`ports`].

pub mod config;
pub mod domain;
pub mod ports;

pub use config::AdConfig;
pub use domain::errors::DomainError;
