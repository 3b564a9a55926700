//! Core error types
//!
//! One taxonomy for the whole registry core; the API layer maps each variant
//! onto an OCI error code and HTTP status.

use thiserror::Error;

use crate::digest::Digest;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("storage error: {0}")]
    Storage(#[from] drydock_storage::StorageError),

    #[error("upstream error: {0}")]
    Upstream(#[from] drydock_proxy::ProxyError),

    #[error("invalid digest: {0}")]
    DigestInvalid(String),

    #[error("invalid repository name: {0}")]
    NameInvalid(String),

    #[error("repository name not known to registry: {0}")]
    NameUnknown(String),

    #[error("invalid tag: {0}")]
    TagInvalid(String),

    #[error("blob unknown to registry: {0}")]
    BlobUnknown(Digest),

    #[error("blob upload unknown to registry: {0}")]
    BlobUploadUnknown(String),

    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    #[error("upload offset mismatch: expected {expected}, got {provided}")]
    RangeInvalid { expected: u64, provided: u64 },

    #[error("provided length did not match content length: expected {expected}, got {actual}")]
    SizeInvalid { expected: u64, actual: u64 },

    #[error("manifest unknown: {reference}")]
    ManifestUnknown { reference: String },

    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    #[error("manifest references unknown blobs")]
    ManifestBlobsUnknown(Vec<Digest>),

    #[error("operation unsupported")]
    Unsupported,

    #[error("descriptor cache error: {0}")]
    Cache(String),
}

impl CoreError {
    /// Collapse a storage `PathNotFound` into a blob miss; everything else
    /// passes through.
    pub(crate) fn blob_from_storage(err: drydock_storage::StorageError, digest: &Digest) -> Self {
        match err {
            drydock_storage::StorageError::PathNotFound(_) => {
                CoreError::BlobUnknown(digest.clone())
            }
            other => CoreError::Storage(other),
        }
    }
}
