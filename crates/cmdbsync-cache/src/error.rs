//! Error types for cache managers.

use cmdbsync_api::ApiError;
use cmdbsync_state::StateError;
use thiserror::Error;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("{cache_type} refresh failed for {failed} of {total} businesses")]
    PartialRefresh {
        cache_type: String,
        failed: usize,
        total: usize,
    },

    #[error("unknown cache type: {0}")]
    UnknownCacheType(String),

    #[error("{cache_type} cache is only maintained by the default tenant, not {tenant}")]
    TenantScope { cache_type: String, tenant: String },
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialize(e.to_string())
    }
}
