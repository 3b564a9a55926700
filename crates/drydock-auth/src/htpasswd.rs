//! Basic-auth access controller
//!
//! Verifies `Authorization: Basic` credentials against a file of
//! `user:argon2-hash` lines. Any authenticated user is granted every access;
//! finer-grained policy belongs to the token controller.

use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::HeaderMap;
use http::header::AUTHORIZATION;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

use crate::access::{Access, AccessController, Grant};
use crate::error::AuthError;

pub struct HtpasswdAccessController {
    realm: String,
    users: HashMap<String, String>,
}

impl HtpasswdAccessController {
    pub fn new(realm: impl Into<String>, users: HashMap<String, String>) -> Self {
        Self {
            realm: realm.into(),
            users,
        }
    }

    /// Load a credentials file of `user:hash` lines; blank lines and `#`
    /// comments are skipped.
    pub fn from_file(realm: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AuthError::Configuration(format!("cannot read credentials: {e}")))?;
        let mut users = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once(':') {
                Some((user, hash)) => {
                    users.insert(user.to_string(), hash.to_string());
                }
                None => warn!("skipping malformed credentials line"),
            }
        }
        Ok(Self::new(realm, users))
    }

    fn challenge(&self) -> AuthError {
        AuthError::Challenge {
            header: format!(r#"Basic realm="{}""#, self.realm),
        }
    }

    fn verify(&self, user: &str, password: &str) -> bool {
        let Some(stored) = self.users.get(user) else {
            return false;
        };
        match PasswordHash::new(stored) {
            Ok(hash) => Argon2::default()
                .verify_password(password.as_bytes(), &hash)
                .is_ok(),
            Err(e) => {
                warn!("unparseable password hash for {}: {}", user, e);
                false
            }
        }
    }
}

#[async_trait]
impl AccessController for HtpasswdAccessController {
    async fn authorized(&self, headers: &HeaderMap, _access: &[Access]) -> Result<Grant, AuthError> {
        let header = headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| self.challenge())?;
        let encoded = header.strip_prefix("Basic ").ok_or_else(|| self.challenge())?;
        let decoded = BASE64
            .decode(encoded.trim())
            .ok()
            .and_then(|raw| String::from_utf8(raw).ok())
            .ok_or_else(|| self.challenge())?;
        let (user, password) = decoded.split_once(':').ok_or_else(|| self.challenge())?;

        if self.verify(user, password) {
            Ok(Grant {
                user: user.to_string(),
            })
        } else {
            Err(self.challenge())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::hash_password;
    use http::HeaderValue;

    fn controller() -> HtpasswdAccessController {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), hash_password("sekrit").unwrap());
        HtpasswdAccessController::new("registry", users)
    }

    fn basic(user: &str, password: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let value = format!("Basic {}", BASE64.encode(format!("{user}:{password}")));
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&value).unwrap());
        headers
    }

    #[tokio::test]
    async fn valid_credentials_grant() {
        let grant = controller()
            .authorized(&basic("alice", "sekrit"), &[])
            .await
            .unwrap();
        assert_eq!(grant.user, "alice");
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_challenge() {
        let controller = controller();
        assert!(matches!(
            controller.authorized(&basic("alice", "wrong"), &[]).await,
            Err(AuthError::Challenge { .. })
        ));
        assert!(matches!(
            controller.authorized(&basic("mallory", "sekrit"), &[]).await,
            Err(AuthError::Challenge { .. })
        ));
    }

    #[tokio::test]
    async fn missing_header_challenges_with_basic_realm() {
        match controller().authorized(&HeaderMap::new(), &[]).await {
            Err(AuthError::Challenge { header }) => {
                assert_eq!(header, r#"Basic realm="registry""#);
            }
            other => panic!("expected challenge, got {other:?}"),
        }
    }
}
