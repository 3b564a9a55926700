//! Bearer-token access controller
//!
//! Validates JWTs whose `access` claim lists the repository scopes the token
//! holder may use. Unauthenticated requests get a challenge naming the token
//! realm and the scope they need; authenticated-but-insufficient requests are
//! denied outright.

use argon2::password_hash::{PasswordHasher, SaltString, rand_core::OsRng};
use argon2::Argon2;
use async_trait::async_trait;
use http::HeaderMap;
use http::header::AUTHORIZATION;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

use crate::access::{Access, AccessController, Grant, scope_for};
use crate::error::AuthError;

/// One scope entry inside a token's `access` claim
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceClaim {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub actions: Vec<String>,
}

/// Claims drydock tokens carry
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    #[serde(default)]
    pub access: Vec<ResourceClaim>,
}

pub struct TokenAccessController {
    realm: String,
    service: String,
    issuer: String,
    key: DecodingKey,
}

impl TokenAccessController {
    pub fn new(
        realm: impl Into<String>,
        service: impl Into<String>,
        issuer: impl Into<String>,
        secret: &[u8],
    ) -> Self {
        Self {
            realm: realm.into(),
            service: service.into(),
            issuer: issuer.into(),
            key: DecodingKey::from_secret(secret),
        }
    }

    fn challenge(&self, access: &[Access]) -> AuthError {
        let mut header = format!(r#"Bearer realm="{}",service="{}""#, self.realm, self.service);
        let scope = scope_for(access);
        if !scope.is_empty() {
            header.push_str(&format!(r#",scope="{scope}""#));
        }
        AuthError::Challenge { header }
    }

    fn covers(claims: &[ResourceClaim], access: &Access) -> bool {
        claims.iter().any(|claim| {
            claim.kind == access.resource.kind()
                && claim.name == access.resource.name()
                && claim
                    .actions
                    .iter()
                    .any(|a| a == access.action.as_str() || a == "*")
        })
    }
}

#[async_trait]
impl AccessController for TokenAccessController {
    async fn authorized(&self, headers: &HeaderMap, access: &[Access]) -> Result<Grant, AuthError> {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or_else(|| self.challenge(access))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.service]);
        let data = decode::<Claims>(token, &self.key, &validation)
            .map_err(|_| self.challenge(access))?;

        for record in access {
            if !Self::covers(&data.claims.access, record) {
                return Err(AuthError::Denied);
            }
        }
        Ok(Grant {
            user: data.claims.sub,
        })
    }
}

/// Hash a password for the htpasswd credentials file
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Configuration(format!("failed to hash password: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};

    const SECRET: &[u8] = b"test-secret";

    fn controller() -> TokenAccessController {
        TokenAccessController::new("http://auth/token", "registry", "auth-server", SECRET)
    }

    fn issue(access: Vec<ResourceClaim>) -> HeaderMap {
        let claims = Claims {
            iss: "auth-server".to_string(),
            sub: "alice".to_string(),
            aud: "registry".to_string(),
            exp: chrono::Utc::now().timestamp() + 300,
            access,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    fn repo_claim(name: &str, actions: &[&str]) -> ResourceClaim {
        ResourceClaim {
            kind: "repository".to_string(),
            name: name.to_string(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn scoped_token_grants_matching_access() {
        let headers = issue(vec![repo_claim("alice/app", &["pull", "push"])]);
        let grant = controller()
            .authorized(&headers, &[Access::pull("alice/app"), Access::push("alice/app")])
            .await
            .unwrap();
        assert_eq!(grant.user, "alice");
    }

    #[tokio::test]
    async fn insufficient_scope_is_denied_not_challenged() {
        let headers = issue(vec![repo_claim("alice/app", &["pull"])]);
        assert!(matches!(
            controller()
                .authorized(&headers, &[Access::push("alice/app")])
                .await,
            Err(AuthError::Denied)
        ));
    }

    #[tokio::test]
    async fn missing_token_challenge_names_the_scope() {
        match controller()
            .authorized(&HeaderMap::new(), &[Access::pull("alice/app")])
            .await
        {
            Err(AuthError::Challenge { header }) => {
                assert!(header.contains(r#"realm="http://auth/token""#));
                assert!(header.contains(r#"scope="repository:alice/app:pull""#));
            }
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wildcard_action_covers_everything() {
        let headers = issue(vec![ResourceClaim {
            kind: "registry".to_string(),
            name: "catalog".to_string(),
            actions: vec!["*".to_string()],
        }]);
        assert!(
            controller()
                .authorized(&headers, &[Access::catalog()])
                .await
                .is_ok()
        );
    }
}
