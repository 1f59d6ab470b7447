//! ID parse errors.

use thiserror::Error;

/// Why a string could not be parsed as a typed ID.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("ID cannot be empty")]
    Empty,

    /// A numeric ID was given without its kind prefix (`12` instead of `s12`).
    #[error("ID missing prefix: expected '{expected}', got '{actual}'")]
    MissingPrefix { expected: &'static str, actual: String },

    /// The ID belongs to another kind (`n3` where a store was expected).
    #[error("wrong ID kind: expected prefix '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// A ULID-based ID without the `_` between prefix and body.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    #[error("invalid numeric ID: {0}")]
    InvalidNumber(String),
}

impl IdError {
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// True for both a missing and a mismatched prefix.
    pub fn is_prefix_error(&self) -> bool {
        matches!(
            self,
            IdError::MissingPrefix { .. } | IdError::InvalidPrefix { .. }
        )
    }
}
