//! Error types for CMDB and directory calls.

use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("cmdb returned error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("rate limit wait exceeded: {0}")]
    RateLimited(String),

    #[error("client configuration error: {0}")]
    Config(String),
}
