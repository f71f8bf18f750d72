//! Error types for the cmdbsync key-value stores.

use thiserror::Error;

/// Result type alias for store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open store: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("redis error: {0}")]
    Redis(String),

    #[error("invalid pattern: {0}")]
    Pattern(String),

    #[error("key is not managed by this cache: {0}")]
    UnmanagedKey(String),
}
