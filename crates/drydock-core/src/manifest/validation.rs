//! Manifest ingest policy
//!
//! URL references in layer descriptors are gated by an allow/deny regex pair,
//! and image indexes can be required to be complete for all (or a listed set
//! of) platforms before they are accepted.

use regex::Regex;

use crate::descriptor::{Descriptor, Platform};
use crate::error::CoreError;

/// Which platform entries of an index must already be present locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlatformPolicy {
    /// Every referenced manifest must be linked
    All,
    /// Only manifests for platforms on the configured list must be linked
    List,
    /// No completeness requirement
    #[default]
    None,
}

/// Validation applied on every manifest put
#[derive(Debug, Default)]
pub struct ManifestPolicy {
    enabled: bool,
    url_allow: Vec<Regex>,
    url_deny: Vec<Regex>,
    index_platforms: PlatformPolicy,
    platform_list: Vec<Platform>,
}

impl ManifestPolicy {
    pub fn new(
        enabled: bool,
        url_allow: &[String],
        url_deny: &[String],
        index_platforms: PlatformPolicy,
        platform_list: Vec<Platform>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            enabled,
            url_allow: url_allow.iter().map(|p| Regex::new(p)).collect::<Result<_, _>>()?,
            url_deny: url_deny.iter().map(|p| Regex::new(p)).collect::<Result<_, _>>()?,
            index_platforms,
            platform_list,
        })
    }

    /// Check the external URLs of every descriptor.
    ///
    /// The allow list is consulted first: when non-empty, a URL matching none
    /// of its patterns is rejected. The deny list is consulted second and a
    /// match rejects. With validation enabled and both lists empty, every URL
    /// is denied.
    pub fn check_urls(&self, descriptors: &[Descriptor]) -> Result<(), CoreError> {
        if !self.enabled {
            return Ok(());
        }
        for descriptor in descriptors {
            for url in &descriptor.urls {
                if self.url_allow.is_empty() && self.url_deny.is_empty() {
                    return Err(CoreError::ManifestInvalid(format!(
                        "external URL not permitted: {url}"
                    )));
                }
                if !self.url_allow.is_empty() && !self.url_allow.iter().any(|re| re.is_match(url)) {
                    return Err(CoreError::ManifestInvalid(format!(
                        "external URL not on allow list: {url}"
                    )));
                }
                if self.url_deny.iter().any(|re| re.is_match(url)) {
                    return Err(CoreError::ManifestInvalid(format!(
                        "external URL denied: {url}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether an index entry for `platform` must already be linked locally
    pub fn platform_required(&self, platform: Option<&Platform>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.index_platforms {
            PlatformPolicy::All => true,
            PlatformPolicy::None => false,
            PlatformPolicy::List => platform.is_some_and(|p| self.platform_list.contains(p)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{Algorithm, Digest};

    fn with_url(url: &str) -> Descriptor {
        let mut d = Descriptor::new(
            "application/octet-stream",
            1,
            Digest::from_bytes(Algorithm::Sha256, b"x"),
        );
        d.urls = vec![url.to_string()];
        d
    }

    #[test]
    fn empty_lists_deny_every_url() {
        let policy =
            ManifestPolicy::new(true, &[], &[], PlatformPolicy::None, vec![]).unwrap();
        assert!(policy.check_urls(&[with_url("https://example.com/layer")]).is_err());
        // But a manifest without URLs is fine.
        let plain = Descriptor::new(
            "application/octet-stream",
            1,
            Digest::from_bytes(Algorithm::Sha256, b"y"),
        );
        assert!(policy.check_urls(&[plain]).is_ok());
    }

    #[test]
    fn allow_list_is_consulted_first() {
        let policy = ManifestPolicy::new(
            true,
            &[r"^https://example\.com/.*$".to_string()],
            &[],
            PlatformPolicy::None,
            vec![],
        )
        .unwrap();
        assert!(policy.check_urls(&[with_url("https://example.com/ok")]).is_ok());
        assert!(policy.check_urls(&[with_url("https://evil.com/no")]).is_err());
    }

    #[test]
    fn deny_overrides_allow() {
        let policy = ManifestPolicy::new(
            true,
            &[r"^https://example\.com/.*$".to_string()],
            &[r"secret".to_string()],
            PlatformPolicy::None,
            vec![],
        )
        .unwrap();
        assert!(policy
            .check_urls(&[with_url("https://example.com/secret/layer")])
            .is_err());
    }

    #[test]
    fn disabled_policy_permits_everything() {
        let policy = ManifestPolicy::default();
        assert!(policy.check_urls(&[with_url("http://anything")]).is_ok());
        assert!(!policy.platform_required(None));
    }

    #[test]
    fn platform_list_scopes_completeness() {
        let amd64 = Platform {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
        };
        let arm = Platform {
            architecture: "arm64".to_string(),
            os: "linux".to_string(),
        };
        let policy = ManifestPolicy::new(
            true,
            &[],
            &[],
            PlatformPolicy::List,
            vec![amd64.clone()],
        )
        .unwrap();
        assert!(policy.platform_required(Some(&amd64)));
        assert!(!policy.platform_required(Some(&arm)));
        assert!(!policy.platform_required(None));
    }
}
