//! Error types for identity parsing.

use thiserror::Error;

/// Errors that can occur when accepting an externally supplied name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The name is empty.
    #[error("name cannot be empty")]
    Empty,

    /// The name collides with the reserved collection selector.
    #[error("'{0}' is reserved and cannot name a single server")]
    Reserved(String),

    /// The name contains a character that cannot appear in an admin API path.
    #[error("invalid character {ch:?} in name '{name}'")]
    InvalidChar { name: String, ch: char },
}
