//! Upstream registry client
//!
//! Speaks the v2 API against a remote registry: answers its
//! `WWW-Authenticate` challenge with a scoped token fetch, caches the token,
//! and retries exactly once on 401. Timeouts here are independent of the
//! inbound request's deadline.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::ProxyError;

/// Type alias for a boxed stream of upstream bytes
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProxyError>> + Send>>;

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v1+prettyjws";

/// Upstream registry configuration
#[derive(Clone, Debug)]
pub struct RemoteConfig {
    /// Base URL of the upstream registry, e.g. `https://registry-1.docker.io`
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Connect/idle-read bound for upstream calls
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token")]
    token: String,
}

/// v2 client for one upstream registry
pub struct RemoteClient {
    config: RemoteConfig,
    client: Client,
    /// `None` = not yet resolved; `Some(None)` = upstream needs no auth
    token: RwLock<Option<Option<String>>>,
}

impl RemoteClient {
    pub fn new(config: RemoteConfig) -> Result<Self, ProxyError> {
        let client = Client::builder()
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout)
            .build()?;
        info!("created upstream client for {}", config.url);
        Ok(Self {
            config,
            client,
            token: RwLock::new(None),
        })
    }

    fn basic_auth_header(&self) -> Option<String> {
        match (&self.config.username, &self.config.password) {
            (Some(user), Some(pass)) => {
                Some(format!("Basic {}", BASE64.encode(format!("{user}:{pass}"))))
            }
            _ => None,
        }
    }

    /// Answer the upstream's challenge for `scope` and return an
    /// Authorization header value, or `None` for an open upstream.
    async fn authenticate(&self, scope: Option<&str>) -> Result<Option<String>, ProxyError> {
        let probe = self
            .client
            .get(format!("{}/v2/", self.config.url))
            .send()
            .await?;

        if probe.status() == StatusCode::UNAUTHORIZED {
            if let Some(challenge) = probe
                .headers()
                .get("www-authenticate")
                .and_then(|h| h.to_str().ok())
                && let Some(token) = self.fetch_token(challenge, scope).await?
            {
                return Ok(Some(token));
            }
            // Challenged but no token endpoint; fall back to basic
            // credentials, which we must actually have.
            return self
                .basic_auth_header()
                .map(Some)
                .ok_or(ProxyError::Unauthorized);
        }

        Ok(self.basic_auth_header())
    }

    /// Parse `Bearer realm="...",service="..."` and fetch a scoped token
    async fn fetch_token(
        &self,
        challenge: &str,
        scope: Option<&str>,
    ) -> Result<Option<String>, ProxyError> {
        let Some(params) = challenge.strip_prefix("Bearer ") else {
            return Ok(None);
        };
        let mut realm = None;
        let mut service = None;
        for part in params.split(',') {
            if let Some((key, value)) = part.split_once('=') {
                let value = value.trim().trim_matches('"');
                match key.trim() {
                    "realm" => realm = Some(value.to_string()),
                    "service" => service = Some(value.to_string()),
                    _ => {}
                }
            }
        }
        let realm = realm.ok_or_else(|| {
            ProxyError::InvalidResponse("missing realm in WWW-Authenticate".to_string())
        })?;

        let mut request = self.client.get(&realm);
        if let Some(service) = service {
            request = request.query(&[("service", service)]);
        }
        if let Some(scope) = scope {
            request = request.query(&[("scope", scope.to_string())]);
        }
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            request = request.basic_auth(user, Some(pass));
        }

        debug!("fetching upstream token from {}", realm);
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ProxyError::TokenRefreshFailed);
        }
        let token: TokenResponse = response.json().await?;
        Ok(Some(format!("Bearer {}", token.token)))
    }

    async fn auth_header(&self, scope: &str) -> Result<Option<String>, ProxyError> {
        if let Some(resolved) = self.token.read().await.clone() {
            return Ok(resolved);
        }
        let resolved = self.authenticate(Some(scope)).await?;
        *self.token.write().await = Some(resolved.clone());
        Ok(resolved)
    }

    /// Issue an authenticated request, refreshing the token once on 401.
    async fn request(
        &self,
        method: Method,
        url: &str,
        scope: &str,
        accept: Option<&str>,
    ) -> Result<Response, ProxyError> {
        let send = |auth: Option<String>| {
            let mut req = self.client.request(method.clone(), url);
            if let Some(auth) = auth {
                req = req.header("Authorization", auth);
            }
            if let Some(accept) = accept {
                req = req.header("Accept", accept);
            }
            req.send()
        };

        let response = send(self.auth_header(scope).await?).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!("upstream token expired, refreshing");
        *self.token.write().await = None;
        Ok(send(self.auth_header(scope).await?).await?)
    }

    fn pull_scope(repository: &str) -> String {
        format!("repository:{repository}:pull")
    }

    /// Probe upstream reachability
    pub async fn ping(&self) -> Result<(), ProxyError> {
        let response = self.client.get(format!("{}/v2/", self.config.url)).send().await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => Ok(()),
            s => Err(ProxyError::UpstreamStatus {
                status: s.as_u16(),
                message: "ping failed".to_string(),
            }),
        }
    }

    /// Fetch a manifest; returns `(bytes, content_type, digest_header)`
    pub async fn get_manifest(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<(Bytes, String, Option<String>), ProxyError> {
        let url = format!("{}/v2/{}/manifests/{}", self.config.url, repository, reference);
        let response = self
            .request(Method::GET, &url, &Self::pull_scope(repository), Some(MANIFEST_ACCEPT))
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(ProxyError::NotFound(format!("{repository}:{reference}")));
            }
            s if !s.is_success() => {
                return Err(ProxyError::UpstreamStatus {
                    status: s.as_u16(),
                    message: format!("manifest fetch for {repository}:{reference}"),
                });
            }
            _ => {}
        }
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("application/vnd.oci.image.manifest.v1+json")
            .to_string();
        let digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;
        Ok((bytes, content_type, digest))
    }

    /// HEAD a manifest; returns `(content_type, digest_header, size)` or
    /// `None` when the upstream does not have it.
    pub async fn head_manifest(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<Option<(String, Option<String>, u64)>, ProxyError> {
        let url = format!("{}/v2/{}/manifests/{}", self.config.url, repository, reference);
        let response = self
            .request(Method::HEAD, &url, &Self::pull_scope(repository), Some(MANIFEST_ACCEPT))
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let content_type = response
                    .headers()
                    .get("content-type")
                    .and_then(|h| h.to_str().ok())
                    .unwrap_or("application/vnd.oci.image.manifest.v1+json")
                    .to_string();
                let digest = response
                    .headers()
                    .get("docker-content-digest")
                    .and_then(|h| h.to_str().ok())
                    .map(str::to_string);
                let size = response.content_length().unwrap_or(0);
                Ok(Some((content_type, digest, size)))
            }
            s => Err(ProxyError::UpstreamStatus {
                status: s.as_u16(),
                message: format!("manifest head for {repository}:{reference}"),
            }),
        }
    }

    /// Stream a blob; returns the byte stream and the declared length
    pub async fn get_blob(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<(ByteStream, u64), ProxyError> {
        let url = format!("{}/v2/{}/blobs/{}", self.config.url, repository, digest);
        let response = self
            .request(Method::GET, &url, &Self::pull_scope(repository), None)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => return Err(ProxyError::NotFound(digest.to_string())),
            s if !s.is_success() => {
                return Err(ProxyError::UpstreamStatus {
                    status: s.as_u16(),
                    message: format!("blob fetch for {digest}"),
                });
            }
            _ => {}
        }
        let size = response.content_length().unwrap_or(0);
        let stream = response.bytes_stream().map(|r| r.map_err(ProxyError::Http));
        Ok((Box::pin(stream), size))
    }

    /// HEAD a blob; returns its size or `None` when absent upstream
    pub async fn head_blob(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<Option<u64>, ProxyError> {
        let url = format!("{}/v2/{}/blobs/{}", self.config.url, repository, digest);
        let response = self
            .request(Method::HEAD, &url, &Self::pull_scope(repository), None)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(response.content_length().unwrap_or(0))),
            s => Err(ProxyError::UpstreamStatus {
                status: s.as_u16(),
                message: format!("blob head for {digest}"),
            }),
        }
    }
}
