//! Repository names, tags, and manifest references

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::digest::Digest;
use crate::error::CoreError;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$").unwrap()
});

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").unwrap());

const NAME_MAX_LEN: usize = 255;

/// A validated repository name
///
/// Lowercase path components separated by slashes, total length capped at
/// 255. Case-sensitive, so the grammar never admits uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryName(String);

impl RepositoryName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RepositoryName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > NAME_MAX_LEN || !NAME_RE.is_match(s) {
            return Err(CoreError::NameInvalid(s.to_string()));
        }
        Ok(RepositoryName(s.to_string()))
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated tag name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag(String);

impl Tag {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Tag {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !TAG_RE.is_match(s) {
            return Err(CoreError::TagInvalid(s.to_string()));
        }
        Ok(Tag(s.to_string()))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A manifest reference: either a tag or a digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestRef {
    Tag(Tag),
    Digest(Digest),
}

impl FromStr for ManifestRef {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Digests always carry a colon, which the tag grammar never allows.
        if s.contains(':') {
            Ok(ManifestRef::Digest(s.parse()?))
        } else {
            Ok(ManifestRef::Tag(s.parse()?))
        }
    }
}

impl fmt::Display for ManifestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestRef::Tag(t) => t.fmt(f),
            ManifestRef::Digest(d) => d.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_repository_names() {
        for name in ["alice/app", "library/nginx", "a", "a-b.c_d/e0", "a/b/c/d"] {
            assert!(name.parse::<RepositoryName>().is_ok(), "rejected {name}");
        }
    }

    #[test]
    fn rejects_invalid_repository_names() {
        let too_long = "a/".repeat(130);
        for name in ["Alice/app", "", "/app", "app/", "a//b", "a b", "-a", too_long.as_str()] {
            assert!(name.parse::<RepositoryName>().is_err(), "accepted {name}");
        }
    }

    #[test]
    fn tag_grammar() {
        assert!("latest".parse::<Tag>().is_ok());
        assert!("v1.0.0-rc_2".parse::<Tag>().is_ok());
        assert!("_hidden".parse::<Tag>().is_ok());
        assert!(".dot".parse::<Tag>().is_err());
        assert!("-dash".parse::<Tag>().is_err());
        assert!("a".repeat(129).parse::<Tag>().is_err());
    }

    #[test]
    fn manifest_ref_disambiguation() {
        assert!(matches!(
            "latest".parse::<ManifestRef>().unwrap(),
            ManifestRef::Tag(_)
        ));
        assert!(matches!(
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
                .parse::<ManifestRef>()
                .unwrap(),
            ManifestRef::Digest(_)
        ));
        assert!("sha256:bad".parse::<ManifestRef>().is_err());
    }
}
