//! Error types for the watcher and orchestrator.

use cmdbsync_api::ApiError;
use cmdbsync_cache::CacheError;
use cmdbsync_core::DecodeError;
use cmdbsync_state::StateError;
use thiserror::Error;

pub type WatchResult<T> = Result<T, WatchError>;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("event codec error: {0}")]
    Decode(String),
}

impl From<DecodeError> for WatchError {
    fn from(e: DecodeError) -> Self {
        WatchError::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for WatchError {
    fn from(e: serde_json::Error) -> Self {
        WatchError::Decode(e.to_string())
    }
}
