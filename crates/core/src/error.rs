//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures of the job model itself (validation, identifiers,
/// state-machine misuse). Storage and publisher failures belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. an empty backoff table).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A job state transition that the state machine does not allow.
    ///
    /// Reaching this is a programming error in the caller, not a user error.
    #[error("invalid transition from {from} via {action}")]
    InvalidTransition { from: &'static str, action: &'static str },

    /// A persisted record violates a job invariant.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(from: &'static str, action: &'static str) -> Self {
        Self::InvalidTransition { from, action }
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptRecord(msg.into())
    }
}
