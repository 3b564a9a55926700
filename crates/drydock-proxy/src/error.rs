//! Upstream client error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream does not have: {0}")]
    NotFound(String),

    #[error("upstream rejected our credentials")]
    Unauthorized,

    #[error("upstream returned {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    #[error("token refresh failed")]
    TokenRefreshFailed,
}
