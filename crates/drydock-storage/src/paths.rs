//! Path mapper
//!
//! Maps logical registry entities onto driver paths. The layout is fixed for
//! compatibility with existing deployments and must stay bit-exact:
//!
//!	<root>/v2
//!	├── blobs
//!	│   └── <algorithm>
//!	│       └── <first two hex chars>
//!	│           └── <hex digest>
//!	│               └── data
//!	└── repositories
//!	    └── <name>
//!	        ├── _layers
//!	        │   └── <algorithm>/<hex>/link
//!	        ├── _manifests
//!	        │   ├── revisions/<algorithm>/<hex>/link
//!	        │   └── tags/<tag>
//!	        │       ├── current/link
//!	        │       └── index/<algorithm>/<hex>/link
//!	        └── _uploads
//!	            └── <uuid>
//!	                ├── data
//!	                ├── startedat
//!	                ├── uuid
//!	                └── hashstates/<algorithm>/<offset>
//!
//! The content-addressable blob store holds the bytes; repositories gain
//! access to a blob only through a link file whose content is the digest
//! text. All functions here are pure.

const ROOT: &str = "/docker/registry/v2";

/// Root of the repositories tree
pub fn repositories_root() -> String {
    format!("{ROOT}/repositories")
}

/// Root of one repository
pub fn repository_path(name: &str) -> String {
    format!("{ROOT}/repositories/{name}")
}

/// Blob content: `/blobs/<alg>/<first2hex>/<hex>/data`
pub fn blob_data_path(algorithm: &str, hex: &str) -> String {
    format!("{ROOT}/blobs/{algorithm}/{}/{hex}/data", &hex[..2])
}

/// Directory holding one blob's data file
pub fn blob_path(algorithm: &str, hex: &str) -> String {
    format!("{ROOT}/blobs/{algorithm}/{}/{hex}", &hex[..2])
}

/// Repository blob link: `_layers/<alg>/<hex>/link`
pub fn layer_link_path(name: &str, algorithm: &str, hex: &str) -> String {
    format!("{ROOT}/repositories/{name}/_layers/{algorithm}/{hex}/link")
}

/// Manifest revision link: `_manifests/revisions/<alg>/<hex>/link`
pub fn manifest_revision_link_path(name: &str, algorithm: &str, hex: &str) -> String {
    format!("{ROOT}/repositories/{name}/_manifests/revisions/{algorithm}/{hex}/link")
}

/// Tag directory root for a repository
pub fn manifest_tags_path(name: &str) -> String {
    format!("{ROOT}/repositories/{name}/_manifests/tags")
}

/// One tag's directory
pub fn manifest_tag_path(name: &str, tag: &str) -> String {
    format!("{ROOT}/repositories/{name}/_manifests/tags/{tag}")
}

/// Tag current pointer: `tags/<tag>/current/link`
pub fn tag_current_link_path(name: &str, tag: &str) -> String {
    format!("{ROOT}/repositories/{name}/_manifests/tags/{tag}/current/link")
}

/// Tag history entry: `tags/<tag>/index/<alg>/<hex>/link`
pub fn tag_index_link_path(name: &str, tag: &str, algorithm: &str, hex: &str) -> String {
    format!("{ROOT}/repositories/{name}/_manifests/tags/{tag}/index/{algorithm}/{hex}/link")
}

/// Root of one repository's upload sessions
pub fn uploads_path(name: &str) -> String {
    format!("{ROOT}/repositories/{name}/_uploads")
}

/// One upload session's directory
pub fn upload_path(name: &str, id: &str) -> String {
    format!("{ROOT}/repositories/{name}/_uploads/{id}")
}

/// Upload session data file
pub fn upload_data_path(name: &str, id: &str) -> String {
    format!("{ROOT}/repositories/{name}/_uploads/{id}/data")
}

/// Upload session start timestamp (RFC 3339 text)
pub fn upload_started_at_path(name: &str, id: &str) -> String {
    format!("{ROOT}/repositories/{name}/_uploads/{id}/startedat")
}

/// Upload session id marker file
pub fn upload_uuid_path(name: &str, id: &str) -> String {
    format!("{ROOT}/repositories/{name}/_uploads/{id}/uuid")
}

/// Resumable hash checkpoint: `hashstates/<alg>/<offset>`
pub fn upload_hash_state_path(name: &str, id: &str, algorithm: &str, offset: u64) -> String {
    format!("{ROOT}/repositories/{name}/_uploads/{id}/hashstates/{algorithm}/{offset}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn blob_layout_is_bit_exact() {
        assert_eq!(
            blob_data_path("sha256", HEX),
            format!("/docker/registry/v2/blobs/sha256/e3/{HEX}/data")
        );
    }

    #[test]
    fn repository_links_are_bit_exact() {
        assert_eq!(
            layer_link_path("alice/app", "sha256", HEX),
            format!("/docker/registry/v2/repositories/alice/app/_layers/sha256/{HEX}/link")
        );
        assert_eq!(
            manifest_revision_link_path("alice/app", "sha256", HEX),
            format!(
                "/docker/registry/v2/repositories/alice/app/_manifests/revisions/sha256/{HEX}/link"
            )
        );
        assert_eq!(
            tag_current_link_path("alice/app", "latest"),
            "/docker/registry/v2/repositories/alice/app/_manifests/tags/latest/current/link"
        );
        assert_eq!(
            tag_index_link_path("alice/app", "latest", "sha256", HEX),
            format!(
                "/docker/registry/v2/repositories/alice/app/_manifests/tags/latest/index/sha256/{HEX}/link"
            )
        );
    }

    #[test]
    fn upload_layout_is_bit_exact() {
        let id = "550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(
            upload_data_path("alice/app", id),
            format!("/docker/registry/v2/repositories/alice/app/_uploads/{id}/data")
        );
        assert_eq!(
            upload_hash_state_path("alice/app", id, "sha256", 4096),
            format!(
                "/docker/registry/v2/repositories/alice/app/_uploads/{id}/hashstates/sha256/4096"
            )
        );
        assert_eq!(
            upload_started_at_path("alice/app", id),
            format!("/docker/registry/v2/repositories/alice/app/_uploads/{id}/startedat")
        );
    }
}
