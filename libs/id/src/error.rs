//! Error types for name and ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing or validating names and IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("{kind} cannot be empty")]
    Empty { kind: &'static str },

    /// The input exceeds the maximum length.
    #[error("{kind} '{value}' exceeds {max} characters")]
    TooLong {
        kind: &'static str,
        value: String,
        max: usize,
    },

    /// The input contains a character outside the allowed set.
    #[error("{kind} '{value}' contains invalid character '{ch}'")]
    InvalidCharacter {
        kind: &'static str,
        value: String,
        ch: char,
    },

    /// The input must start and end with an alphanumeric character.
    #[error("{kind} '{value}' must start and end with an alphanumeric character")]
    InvalidBoundary { kind: &'static str, value: String },

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty { .. })
    }
}
