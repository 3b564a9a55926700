//! Header-presence access controller
//!
//! Grants any request carrying an `Authorization` header, regardless of its
//! content. Useful for development and tests, never for production.

use async_trait::async_trait;
use http::HeaderMap;
use http::header::AUTHORIZATION;

use crate::access::{Access, AccessController, Grant};
use crate::error::AuthError;

pub struct SillyAccessController {
    realm: String,
    service: String,
}

impl SillyAccessController {
    pub fn new(realm: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            service: service.into(),
        }
    }
}

#[async_trait]
impl AccessController for SillyAccessController {
    async fn authorized(&self, headers: &HeaderMap, _access: &[Access]) -> Result<Grant, AuthError> {
        match headers.get(AUTHORIZATION) {
            Some(_) => Ok(Grant {
                user: "silly".to_string(),
            }),
            None => Err(AuthError::Challenge {
                header: format!(r#"Bearer realm="{}",service="{}""#, self.realm, self.service),
            }),
        }
    }
}
