//! Blob descriptors

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// The `{digest, size, mediaType}` triple returned for any addressable
/// artifact. Immutable once written; keyed uniquely by digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: Digest,
    /// External locations content may be fetched from; subject to the
    /// manifest URL policy at ingest time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, size: u64, digest: Digest) -> Self {
        Self {
            media_type: media_type.into(),
            size,
            digest,
            urls: Vec::new(),
        }
    }
}

/// An `{architecture, os}` pair as used by image indexes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}
