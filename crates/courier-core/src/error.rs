//! Error types and result handling for storage and domain operations.
//!
//! Storage backends translate their native failures into `CoreError` so the
//! delivery layer can treat every backend the same way.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and model operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Storage backend failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Returns `true` for lookups that found nothing.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput(format!("serialization failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = CoreError::NotFound("webhook 42".to_string());
        assert_eq!(err.to_string(), "Not found: webhook 42");
        assert!(err.is_not_found());

        let err = CoreError::ConstraintViolation("duplicate key".to_string());
        assert!(!err.is_not_found());
    }
}
