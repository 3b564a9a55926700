//! Manifest handling
//!
//! The registry accepts Schema 2 manifests and manifest lists, OCI image
//! manifests and indexes, and (read-only, legacy) Schema 1 signed manifests.
//! A manifest's identity is the digest over the exact bytes presented, never
//! a re-serialization.

mod store;
mod validation;

pub use store::ManifestStore;
pub use validation::{ManifestPolicy, PlatformPolicy};

use serde::Deserialize;

use crate::descriptor::{Descriptor, Platform};
use crate::error::CoreError;

/// Media types understood by the manifest store
pub mod media_type {
    pub const SCHEMA2_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const SCHEMA2_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const SCHEMA1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
    pub const SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
}

/// One entry of a manifest list / image index
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    #[serde(flatten)]
    pub descriptor: Descriptor,
    #[serde(default)]
    pub platform: Option<Platform>,
}

/// A parsed manifest, reduced to what validation and storage need
#[derive(Debug, Clone)]
pub enum ParsedManifest {
    /// Schema 2 or OCI image manifest: a config blob plus layers
    Image {
        media_type: String,
        config: Descriptor,
        layers: Vec<Descriptor>,
    },
    /// Schema 2 manifest list or OCI image index
    Index {
        media_type: String,
        manifests: Vec<IndexEntry>,
    },
    /// Legacy signed manifest; readable, never writable
    Schema1 { media_type: String },
}

impl ParsedManifest {
    pub fn media_type(&self) -> &str {
        match self {
            ParsedManifest::Image { media_type, .. } => media_type,
            ParsedManifest::Index { media_type, .. } => media_type,
            ParsedManifest::Schema1 { media_type } => media_type,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImagePayload {
    #[allow(dead_code)]
    schema_version: u64,
    #[serde(default)]
    media_type: Option<String>,
    config: Descriptor,
    layers: Vec<Descriptor>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexPayload {
    #[allow(dead_code)]
    schema_version: u64,
    #[serde(default)]
    media_type: Option<String>,
    manifests: Vec<IndexEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Probe {
    #[serde(default)]
    schema_version: Option<u64>,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<serde_json::Value>,
    #[serde(default)]
    config: Option<serde_json::Value>,
    #[serde(default)]
    fs_layers: Option<serde_json::Value>,
}

/// Detect the manifest variant and parse it.
///
/// The Content-Type header wins when it names a known manifest type; OCI
/// payloads frequently omit `mediaType`, so structure sniffing is the
/// fallback of last resort.
pub fn parse(payload: &[u8], content_type: Option<&str>) -> Result<ParsedManifest, CoreError> {
    let probe: Probe = serde_json::from_slice(payload)
        .map_err(|e| CoreError::ManifestInvalid(format!("malformed JSON: {e}")))?;

    let declared = content_type
        .filter(|ct| is_manifest_media_type(ct))
        .map(str::to_string)
        .or(probe.media_type.clone());

    let media = match declared {
        Some(media) => media,
        None => {
            if probe.schema_version == Some(1) || probe.fs_layers.is_some() {
                media_type::SCHEMA1_SIGNED.to_string()
            } else if probe.manifests.is_some() {
                media_type::OCI_INDEX.to_string()
            } else if probe.config.is_some() {
                media_type::OCI_MANIFEST.to_string()
            } else {
                return Err(CoreError::ManifestInvalid(
                    "unable to determine manifest type".to_string(),
                ));
            }
        }
    };

    match media.as_str() {
        media_type::SCHEMA2_MANIFEST | media_type::OCI_MANIFEST => {
            let parsed: ImagePayload = serde_json::from_slice(payload)
                .map_err(|e| CoreError::ManifestInvalid(format!("missing required field: {e}")))?;
            Ok(ParsedManifest::Image {
                media_type: media,
                config: parsed.config,
                layers: parsed.layers,
            })
        }
        media_type::SCHEMA2_LIST | media_type::OCI_INDEX => {
            let parsed: IndexPayload = serde_json::from_slice(payload)
                .map_err(|e| CoreError::ManifestInvalid(format!("missing required field: {e}")))?;
            Ok(ParsedManifest::Index {
                media_type: media,
                manifests: parsed.manifests,
            })
        }
        media_type::SCHEMA1_SIGNED | media_type::SCHEMA1 => {
            Ok(ParsedManifest::Schema1 { media_type: media })
        }
        other => Err(CoreError::ManifestInvalid(format!(
            "unsupported manifest media type: {other}"
        ))),
    }
}

fn is_manifest_media_type(ct: &str) -> bool {
    matches!(
        ct,
        media_type::SCHEMA2_MANIFEST
            | media_type::SCHEMA2_LIST
            | media_type::OCI_MANIFEST
            | media_type::OCI_INDEX
            | media_type::SCHEMA1_SIGNED
            | media_type::SCHEMA1
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYER: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn schema2_manifest() -> String {
        format!(
            r#"{{
              "schemaVersion": 2,
              "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
              "config": {{"mediaType": "application/vnd.docker.container.image.v1+json", "size": 7023, "digest": "{LAYER}"}},
              "layers": [{{"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "size": 32654, "digest": "{LAYER}"}}]
            }}"#
        )
    }

    #[test]
    fn parses_schema2_manifest() {
        let parsed = parse(schema2_manifest().as_bytes(), None).unwrap();
        match parsed {
            ParsedManifest::Image {
                media_type, layers, ..
            } => {
                assert_eq!(media_type, media_type::SCHEMA2_MANIFEST);
                assert_eq!(layers.len(), 1);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn sniffs_oci_manifest_without_media_type() {
        let payload = format!(
            r#"{{
              "schemaVersion": 2,
              "config": {{"mediaType": "application/vnd.oci.image.config.v1+json", "size": 10, "digest": "{LAYER}"}},
              "layers": []
            }}"#
        );
        let parsed = parse(payload.as_bytes(), None).unwrap();
        assert_eq!(parsed.media_type(), media_type::OCI_MANIFEST);
    }

    #[test]
    fn parses_index_with_platforms() {
        let payload = format!(
            r#"{{
              "schemaVersion": 2,
              "mediaType": "application/vnd.oci.image.index.v1+json",
              "manifests": [
                {{"mediaType": "application/vnd.oci.image.manifest.v1+json", "size": 500, "digest": "{LAYER}",
                  "platform": {{"architecture": "amd64", "os": "linux"}}}}
              ]
            }}"#
        );
        match parse(payload.as_bytes(), None).unwrap() {
            ParsedManifest::Index { manifests, .. } => {
                assert_eq!(manifests[0].platform.as_ref().unwrap().architecture, "amd64");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn detects_schema1_by_fs_layers() {
        let payload = format!(
            r#"{{"schemaVersion": 1, "name": "a/b", "tag": "latest", "fsLayers": [{{"blobSum": "{LAYER}"}}]}}"#
        );
        assert!(matches!(
            parse(payload.as_bytes(), None).unwrap(),
            ParsedManifest::Schema1 { .. }
        ));
    }

    #[test]
    fn content_type_header_wins_over_sniffing() {
        let parsed = parse(
            schema2_manifest().as_bytes(),
            Some(media_type::SCHEMA2_MANIFEST),
        )
        .unwrap();
        assert_eq!(parsed.media_type(), media_type::SCHEMA2_MANIFEST);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse(b"not json", None),
            Err(CoreError::ManifestInvalid(_))
        ));
        assert!(matches!(
            parse(b"{}", None),
            Err(CoreError::ManifestInvalid(_))
        ));
        // Declared image manifest missing its config is malformed.
        assert!(matches!(
            parse(
                br#"{"schemaVersion": 2, "layers": []}"#,
                Some(media_type::SCHEMA2_MANIFEST)
            ),
            Err(CoreError::ManifestInvalid(_))
        ));
    }
}
