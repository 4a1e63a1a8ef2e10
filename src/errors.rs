//! Error types for engine operations.
//!
//! Three categories, mirrored from the public contract:
//! - validation errors carry every problem found in one pass, so a caller
//!   can surface all of them at once;
//! - state errors (wrong lifecycle transition, unknown test/variant) are
//!   recoverable by the caller;
//! - collaborator failures (store, codec) propagate without corrupting
//!   in-memory state.

use crate::store::StoreError;

/// Errors returned by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration rejected; contains every validation failure found.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Operation not legal in the test's current lifecycle state.
    #[error("invalid state: {0}")]
    State(String),

    #[error("test not found: {0}")]
    TestNotFound(String),

    #[error("variant not found: {0}")]
    VariantNotFound(String),

    /// Persistent store failure. In-memory state is unchanged.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Value could not be encoded or decoded for the store.
    #[error("serialization error: {0}")]
    Codec(String),
}

impl EngineError {
    /// Machine-readable code for event payloads and client handling.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::State(_) => "INVALID_STATE",
            Self::TestNotFound(_) => "TEST_NOT_FOUND",
            Self::VariantNotFound(_) => "VARIANT_NOT_FOUND",
            Self::Store(_) => "STORAGE_ERROR",
            Self::Codec(_) => "SERIALIZATION_ERROR",
        }
    }

    /// All human-readable messages carried by this error.
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::Validation(errors) => errors.clone(),
            other => vec![other.to_string()],
        }
    }
}

/// Type alias for Results using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;
