//! Access control error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    /// The client must authenticate; `header` is the `WWW-Authenticate`
    /// value to send with the 401.
    #[error("authentication required")]
    Challenge { header: String },

    /// Authenticated but not permitted for the requested access
    #[error("access denied")]
    Denied,

    /// Controller misconfiguration; reported as 400 without detail so the
    /// registry's auth setup is not leaked to clients.
    #[error("access controller configuration error: {0}")]
    Configuration(String),
}
