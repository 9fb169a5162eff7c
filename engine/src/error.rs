//! Error types for the Rollcall sync engine.

use crate::{ChangeId, EntityId, Version};
use thiserror::Error;

/// All possible errors from the sync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Resolution errors
    #[error("resolver failed for entity '{entity_id}': {message}")]
    ResolverFailed {
        entity_id: EntityId,
        message: String,
    },

    #[error("escalation handler failed for entity '{entity_id}': {message}")]
    EscalationFailed {
        entity_id: EntityId,
        message: String,
    },

    // Queue errors
    #[error("invalid change payload: {0}")]
    InvalidChange(String),

    #[error("change not found: {0}")]
    ChangeNotFound(ChangeId),

    #[error("version mismatch for entity '{entity_id}': expected {expected}, got {actual}")]
    VersionMismatch {
        entity_id: EntityId,
        expected: Version,
        actual: Version,
    },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
