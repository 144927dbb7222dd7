//! Protocol error types.

use thiserror::Error;

/// Errors raised while building or decoding query IR.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization failed.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The query is structurally invalid.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}
