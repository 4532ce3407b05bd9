//! Domain error types

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier that must be non-empty was empty or malformed
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    /// A forest configuration violated one of its invariants
    #[error("Invalid forest configuration: {0}")]
    InvalidForest(String),

    /// An LDAP search filter was rejected before being sent
    #[error("Invalid search filter: {0}")]
    InvalidFilter(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
