//! Content digests
//!
//! A digest is the canonical address of a blob: `<algorithm>:<hex>`, with the
//! hex lowercase and exactly the algorithm's output length. Parsing is strict;
//! anything else is `DIGEST_INVALID`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Expected length of the lowercase hex encoding
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "sha256" => Some(Algorithm::Sha256),
            "sha512" => Some(Algorithm::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed content address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Hash `data` with `algorithm`
    pub fn from_bytes(algorithm: Algorithm, data: &[u8]) -> Self {
        let mut digester = Digester::new(algorithm);
        digester.update(data);
        digester.finalize()
    }
}

impl FromStr for Digest {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (alg, hex) = s
            .split_once(':')
            .ok_or_else(|| CoreError::DigestInvalid(s.to_string()))?;
        let algorithm =
            Algorithm::parse(alg).ok_or_else(|| CoreError::DigestInvalid(s.to_string()))?;
        if hex.len() != algorithm.hex_len()
            || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(CoreError::DigestInvalid(s.to_string()));
        }
        Ok(Digest {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Streaming hasher producing a [`Digest`]
///
/// Cloneable so callers can checkpoint the state before feeding bytes whose
/// durability is not yet known.
#[derive(Clone)]
pub struct Digester {
    algorithm: Algorithm,
    state: DigestState,
    offset: u64,
}

#[derive(Clone)]
enum DigestState {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Digester {
    pub fn new(algorithm: Algorithm) -> Self {
        let state = match algorithm {
            Algorithm::Sha256 => DigestState::Sha256(Sha256::new()),
            Algorithm::Sha512 => DigestState::Sha512(Sha512::new()),
        };
        Self {
            algorithm,
            state,
            offset: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            DigestState::Sha256(h) => h.update(data),
            DigestState::Sha512(h) => h.update(data),
        }
        self.offset += data.len() as u64;
    }

    /// Bytes hashed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn finalize(self) -> Digest {
        let hex = match self.state {
            DigestState::Sha256(h) => hex::encode(h.finalize()),
            DigestState::Sha512(h) => hex::encode(h.finalize()),
        };
        Digest {
            algorithm: self.algorithm,
            hex,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn parses_well_formed_digests() {
        let d: Digest = EMPTY_SHA256.parse().unwrap();
        assert_eq!(d.algorithm(), Algorithm::Sha256);
        assert_eq!(d.to_string(), EMPTY_SHA256);
    }

    #[test]
    fn rejects_malformed_digests() {
        for s in [
            "sha256",
            "md5:abcd",
            "sha256:short",
            // uppercase hex
            "sha256:E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855",
            // non-hex characters
            "sha256:zzb0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        ] {
            assert!(s.parse::<Digest>().is_err(), "accepted {s}");
        }
    }

    #[test]
    fn digester_matches_one_shot_hash() {
        let mut digester = Digester::new(Algorithm::Sha256);
        digester.update(b"hello ");
        digester.update(b"world");
        assert_eq!(
            digester.finalize(),
            Digest::from_bytes(Algorithm::Sha256, b"hello world")
        );
    }

    #[test]
    fn empty_hash_is_the_well_known_value() {
        assert_eq!(
            Digest::from_bytes(Algorithm::Sha256, b"").to_string(),
            EMPTY_SHA256
        );
    }
}
