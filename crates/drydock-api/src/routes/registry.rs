//! OCI Distribution v2 routes
//!
//! Repository names contain slashes, so everything under `/v2/` is matched
//! with a wildcard and resolved here. Each branch assembles the access
//! records for its method and resource, calls out to the access controller,
//! and only then touches the namespace.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use drydock_auth::{Access, AuthError};
use drydock_core::{
    CoreError, Descriptor, Digest, Event, EventAction, ManifestRef, Repository, StoredManifest,
};
use drydock_storage::ByteStream;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v2/", get(version_check))
        .route("/v2/_catalog", get(catalog))
        .route(
            "/v2/{*path}",
            get(dispatch_get)
                .post(dispatch_post)
                .put(dispatch_put)
                .patch(dispatch_patch)
                .delete(dispatch_delete),
        )
}

// ==================== Path resolution ====================

enum RegistryRequest {
    Tags { name: String },
    Manifest { name: String, reference: String },
    Blob { name: String, digest: String },
    StartUpload { name: String },
    Upload { name: String, id: String },
}

fn parse_registry_path(path: &str) -> Option<RegistryRequest> {
    if let Some(name) = path.strip_suffix("/tags/list") {
        return Some(RegistryRequest::Tags {
            name: name.to_string(),
        });
    }
    if let Some(idx) = path.rfind("/manifests/") {
        return Some(RegistryRequest::Manifest {
            name: path[..idx].to_string(),
            reference: path[idx + "/manifests/".len()..].to_string(),
        });
    }
    if let Some(name) = path.strip_suffix("/blobs/uploads") {
        return Some(RegistryRequest::StartUpload {
            name: name.to_string(),
        });
    }
    if let Some(idx) = path.rfind("/blobs/uploads/") {
        let name = path[..idx].to_string();
        let id = &path[idx + "/blobs/uploads/".len()..];
        return Some(if id.is_empty() {
            RegistryRequest::StartUpload { name }
        } else {
            RegistryRequest::Upload {
                name,
                id: id.to_string(),
            }
        });
    }
    if let Some(idx) = path.rfind("/blobs/") {
        return Some(RegistryRequest::Blob {
            name: path[..idx].to_string(),
            digest: path[idx + "/blobs/".len()..].to_string(),
        });
    }
    None
}

// ==================== Shared helpers ====================

async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    access: &[Access],
) -> Result<(), ApiError> {
    let Some(controller) = &state.auth else {
        return Ok(());
    };
    controller
        .authorized(headers, access)
        .await
        .map(|_| ())
        .map_err(|e| match e {
            AuthError::Challenge { header } => ApiError::Challenge { header },
            AuthError::Denied => ApiError::Denied,
            AuthError::Configuration(_) => ApiError::AuthInternal,
        })
}

fn repository(state: &AppState, name: &str) -> Result<Repository, ApiError> {
    Ok(state.namespace.repository(name)?)
}

fn notify(state: &AppState, action: EventAction, repository: &str, target: Option<Descriptor>) {
    if let Some(events) = &state.events {
        events.dispatch(Event::new(action, repository, target));
    }
}

fn parse_digest(raw: &str) -> Result<Digest, ApiError> {
    Ok(raw.parse::<Digest>()?)
}

fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or(HeaderValue::from_static("invalid"))
}

/// Upload progress header: `0-<bytesWritten-1>`, or `0-0` for an empty session
fn upload_range(size: u64) -> String {
    format!("0-{}", size.saturating_sub(1))
}

/// Parse a blob request's `Range: bytes=a-b` header
fn parse_byte_range(headers: &HeaderMap) -> Option<(u64, u64)> {
    let raw = headers.get(header::RANGE)?.to_str().ok()?;
    let (start, end) = raw.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// Parse an upload PATCH's `Content-Range: a-b` header
fn parse_content_range(headers: &HeaderMap) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(raw) = headers.get(header::CONTENT_RANGE) else {
        return Ok(None);
    };
    let raw = raw
        .to_str()
        .map_err(|_| ApiError::BadRequest("unreadable Content-Range".to_string()))?;
    let range = raw.trim().trim_start_matches("bytes ");
    let parsed = range.split_once('-').and_then(|(start, end)| {
        Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
    });
    match parsed {
        Some(range) => Ok(Some(range)),
        None => Err(ApiError::BadRequest(format!(
            "malformed Content-Range: {raw}"
        ))),
    }
}

/// Truncate a stream after `remaining` bytes
fn take_bytes(inner: ByteStream, remaining: u64) -> ByteStream {
    Box::pin(futures::stream::unfold(
        (inner, remaining),
        |(mut inner, mut remaining)| async move {
            if remaining == 0 {
                return None;
            }
            match inner.next().await {
                Some(Ok(mut chunk)) => {
                    if chunk.len() as u64 > remaining {
                        chunk = chunk.slice(..remaining as usize);
                    }
                    remaining -= chunk.len() as u64;
                    Some((Ok(chunk), (inner, remaining)))
                }
                Some(Err(e)) => Some((Err(e), (inner, 0))),
                None => None,
            }
        },
    ))
}

fn manifest_response(manifest: StoredManifest, include_body: bool) -> Response {
    let mut response = if include_body {
        (StatusCode::OK, manifest.bytes.clone()).into_response()
    } else {
        StatusCode::OK.into_response()
    };
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, header_value(&manifest.media_type));
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(manifest.bytes.len() as u64),
    );
    headers.insert(
        "Docker-Content-Digest",
        header_value(&manifest.digest.to_string()),
    );
    response
}

// ==================== /v2/ and catalog ====================

/// GET or HEAD `/v2/` - API version check
async fn version_check(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    authorize(&state, &headers, &[]).await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        "{}",
    )
        .into_response())
}

/// GET `/v2/_catalog` - repository enumeration
async fn catalog(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers, &[Access::catalog()]).await?;
    let n: usize = query
        .get("n")
        .and_then(|n| n.parse().ok())
        .unwrap_or(100)
        .min(1000);
    let last = query.get("last").map(String::as_str);
    let page = state.namespace.repositories(last, n).await?;

    let mut response = axum::Json(serde_json::json!({
        "repositories": page.repositories,
    }))
    .into_response();
    if page.has_more
        && let Some(last) = page.repositories.last()
    {
        response.headers_mut().insert(
            header::LINK,
            header_value(&format!("</v2/_catalog?last={last}&n={n}>; rel=\"next\"")),
        );
    }
    Ok(response)
}

// ==================== GET / HEAD dispatch ====================

async fn dispatch_get(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let request = parse_registry_path(&path)
        .ok_or_else(|| ApiError::Core(CoreError::NameUnknown(path.clone())))?;
    let is_head = method == Method::HEAD;

    match request {
        RegistryRequest::Tags { name } => {
            authorize(&state, &headers, &[Access::pull(&name)]).await?;
            let repo = repository(&state, &name)?;
            let mut tags = repo.tags.all().await?;
            if let Some(last) = query.get("last") {
                tags.retain(|t| t.as_str() > last.as_str());
            }
            let mut has_more = false;
            if let Some(n) = query.get("n").and_then(|n| n.parse::<usize>().ok()) {
                has_more = tags.len() > n;
                tags.truncate(n);
            }
            let mut response = axum::Json(serde_json::json!({
                "name": name,
                "tags": tags,
            }))
            .into_response();
            if has_more && let Some(last) = tags.last() {
                response.headers_mut().insert(
                    header::LINK,
                    header_value(&format!("</v2/{name}/tags/list?last={last}>; rel=\"next\"")),
                );
            }
            Ok(response)
        }

        RegistryRequest::Manifest { name, reference } => {
            authorize(&state, &headers, &[Access::pull(&name)]).await?;
            let repo = repository(&state, &name)?;
            let reference: ManifestRef = reference.parse()?;
            let manifest = repo.manifests.get(&reference).await?;
            if !is_head {
                let target = Descriptor::new(
                    manifest.media_type.clone(),
                    manifest.bytes.len() as u64,
                    manifest.digest.clone(),
                );
                notify(&state, EventAction::Pull, &name, Some(target));
            }
            Ok(manifest_response(manifest, !is_head))
        }

        RegistryRequest::Blob { name, digest } => {
            authorize(&state, &headers, &[Access::pull(&name)]).await?;
            let repo = repository(&state, &name)?;
            let digest = parse_digest(&digest)?;
            if is_head {
                let desc = repo.blobs.stat(&digest).await?;
                let mut response = StatusCode::OK.into_response();
                let h = response.headers_mut();
                h.insert(header::CONTENT_TYPE, header_value(&desc.media_type));
                h.insert(header::CONTENT_LENGTH, HeaderValue::from(desc.size));
                h.insert("Docker-Content-Digest", header_value(&digest.to_string()));
                return Ok(response);
            }
            serve_blob(&state, &repo, &name, &digest, &headers).await
        }

        RegistryRequest::Upload { name, id } => {
            authorize(&state, &headers, &[Access::pull(&name)]).await?;
            let repo = repository(&state, &name)?;
            let offset = repo.uploads.status(&id).await?;
            let mut response = StatusCode::NO_CONTENT.into_response();
            let h = response.headers_mut();
            h.insert(
                header::LOCATION,
                header_value(&format!("/v2/{name}/blobs/uploads/{id}")),
            );
            h.insert("Docker-Upload-UUID", header_value(&id));
            h.insert(header::RANGE, header_value(&upload_range(offset)));
            Ok(response)
        }

        RegistryRequest::StartUpload { .. } => Err(ApiError::Core(CoreError::Unsupported)),
    }
}

async fn serve_blob(
    state: &AppState,
    repo: &Repository,
    name: &str,
    digest: &Digest,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let range = parse_byte_range(headers);

    // Offload to a signed URL when the driver can produce one; ranged
    // requests are always served directly.
    if state.redirect_enabled
        && range.is_none()
        && let Some(url) = repo.blobs.redirect_url("GET", digest).await?
    {
        debug!("redirecting blob {} to driver URL", digest);
        let mut response = StatusCode::TEMPORARY_REDIRECT.into_response();
        response
            .headers_mut()
            .insert(header::LOCATION, header_value(&url));
        return Ok(response);
    }

    match range {
        None => {
            let (stream, desc) = repo.blobs.open(digest, 0).await?;
            notify(state, EventAction::Pull, name, Some(desc.clone()));
            let mut response =
                (StatusCode::OK, axum::body::Body::from_stream(stream)).into_response();
            let h = response.headers_mut();
            h.insert(header::CONTENT_TYPE, header_value(&desc.media_type));
            // A proxied upstream may not declare a length; omitting the
            // header lets the transfer fall back to chunked encoding.
            if desc.size > 0 {
                h.insert(header::CONTENT_LENGTH, HeaderValue::from(desc.size));
            }
            h.insert("Docker-Content-Digest", header_value(&digest.to_string()));
            Ok(response)
        }
        Some((start, end)) => {
            let desc = repo.blobs.stat(digest).await?;
            let end = end.min(desc.size.saturating_sub(1));
            if start > end || start >= desc.size {
                return Err(ApiError::Core(CoreError::RangeInvalid {
                    expected: desc.size,
                    provided: start,
                }));
            }
            let (stream, _) = repo.blobs.open(digest, start).await?;
            let len = end - start + 1;
            let body = axum::body::Body::from_stream(take_bytes(stream, len));
            let mut response = (StatusCode::PARTIAL_CONTENT, body).into_response();
            let h = response.headers_mut();
            h.insert(header::CONTENT_TYPE, header_value(&desc.media_type));
            h.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            h.insert(
                header::CONTENT_RANGE,
                header_value(&format!("bytes {start}-{end}/{}", desc.size)),
            );
            h.insert("Docker-Content-Digest", header_value(&digest.to_string()));
            Ok(response)
        }
    }
}

// ==================== POST dispatch ====================

async fn dispatch_post(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let request = parse_registry_path(&path)
        .ok_or_else(|| ApiError::Core(CoreError::NameUnknown(path.clone())))?;
    let RegistryRequest::StartUpload { name } = request else {
        return Err(ApiError::Core(CoreError::Unsupported));
    };

    let mount = query.get("mount").map(String::as_str);
    let from = query.get("from").map(String::as_str);

    let mut access = vec![Access::pull(&name), Access::push(&name)];
    if let (Some(_), Some(from)) = (mount, from) {
        // Cross-repository mounts additionally need pull on the source.
        access.push(Access::pull(from));
    }
    authorize(&state, &headers, &access).await?;

    let repo = repository(&state, &name)?;

    if let (Some(mount), Some(from)) = (mount, from) {
        let digest = parse_digest(mount)?;
        let from_repo: drydock_core::RepositoryName = from
            .parse()
            .map_err(|_| ApiError::Core(CoreError::NameInvalid(from.to_string())))?;
        match repo.blobs.mount(&from_repo, &digest).await {
            Ok(desc) => {
                notify(&state, EventAction::Mount, &name, Some(desc));
                let mut response = StatusCode::CREATED.into_response();
                let h = response.headers_mut();
                h.insert(
                    header::LOCATION,
                    header_value(&format!("/v2/{name}/blobs/{digest}")),
                );
                h.insert("Docker-Content-Digest", header_value(&digest.to_string()));
                return Ok(response);
            }
            // An unmountable digest falls back to a regular upload session.
            Err(CoreError::BlobUnknown(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    let session = repo.uploads.create().await?;
    let mut response = StatusCode::ACCEPTED.into_response();
    let h = response.headers_mut();
    h.insert(
        header::LOCATION,
        header_value(&format!("/v2/{name}/blobs/uploads/{}", session.id)),
    );
    h.insert("Docker-Upload-UUID", header_value(&session.id));
    h.insert(header::RANGE, header_value(&upload_range(session.offset)));
    Ok(response)
}

// ==================== PATCH dispatch ====================

async fn dispatch_patch(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = parse_registry_path(&path)
        .ok_or_else(|| ApiError::Core(CoreError::NameUnknown(path.clone())))?;
    let RegistryRequest::Upload { name, id } = request else {
        return Err(ApiError::Core(CoreError::Unsupported));
    };
    authorize(&state, &headers, &[Access::pull(&name), Access::push(&name)]).await?;
    let repo = repository(&state, &name)?;

    let offset = match parse_content_range(&headers)? {
        Some((start, end)) => {
            let declared = end.saturating_sub(start) + 1;
            if declared != body.len() as u64 {
                return Err(ApiError::Core(CoreError::SizeInvalid {
                    expected: declared,
                    actual: body.len() as u64,
                }));
            }
            Some(start)
        }
        None => None,
    };

    let size = repo.uploads.append(&id, offset, body).await?;
    let mut response = StatusCode::ACCEPTED.into_response();
    let h = response.headers_mut();
    h.insert(
        header::LOCATION,
        header_value(&format!("/v2/{name}/blobs/uploads/{id}")),
    );
    h.insert("Docker-Upload-UUID", header_value(&id));
    h.insert(header::RANGE, header_value(&upload_range(size)));
    Ok(response)
}

// ==================== PUT dispatch ====================

async fn dispatch_put(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = parse_registry_path(&path)
        .ok_or_else(|| ApiError::Core(CoreError::NameUnknown(path.clone())))?;

    match request {
        RegistryRequest::Manifest { name, reference } => {
            authorize(&state, &headers, &[Access::pull(&name), Access::push(&name)]).await?;
            let repo = repository(&state, &name)?;
            let reference: ManifestRef = reference.parse()?;
            let content_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|h| h.to_str().ok());
            let tag = match &reference {
                ManifestRef::Tag(tag) => Some(tag),
                ManifestRef::Digest(expected) => {
                    // Verify the payload against the named digest before
                    // anything is stored.
                    let actual = Digest::from_bytes(expected.algorithm(), &body);
                    if actual != *expected {
                        return Err(ApiError::Core(CoreError::DigestInvalid(format!(
                            "manifest bytes hash to {actual}, request named {expected}"
                        ))));
                    }
                    None
                }
            };
            let size = body.len() as u64;
            let digest = repo.manifests.put(body, content_type, tag).await?;
            notify(
                &state,
                EventAction::Push,
                &name,
                Some(Descriptor::new(
                    content_type.unwrap_or("application/octet-stream"),
                    size,
                    digest.clone(),
                )),
            );
            let mut response = StatusCode::CREATED.into_response();
            let h = response.headers_mut();
            h.insert(
                header::LOCATION,
                header_value(&format!("/v2/{name}/manifests/{digest}")),
            );
            h.insert("Docker-Content-Digest", header_value(&digest.to_string()));
            Ok(response)
        }

        RegistryRequest::Upload { name, id } => {
            authorize(&state, &headers, &[Access::pull(&name), Access::push(&name)]).await?;
            let repo = repository(&state, &name)?;
            let digest = query
                .get("digest")
                .ok_or_else(|| {
                    ApiError::Core(CoreError::DigestInvalid(
                        "digest parameter missing".to_string(),
                    ))
                })
                .and_then(|raw| parse_digest(raw))?;
            let desc = repo.uploads.commit(&id, &digest, body).await?;
            notify(&state, EventAction::Push, &name, Some(desc));
            let mut response = StatusCode::CREATED.into_response();
            let h = response.headers_mut();
            h.insert(
                header::LOCATION,
                header_value(&format!("/v2/{name}/blobs/{digest}")),
            );
            h.insert("Docker-Content-Digest", header_value(&digest.to_string()));
            Ok(response)
        }

        _ => Err(ApiError::Core(CoreError::Unsupported)),
    }
}

// ==================== DELETE dispatch ====================

async fn dispatch_delete(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let request = parse_registry_path(&path)
        .ok_or_else(|| ApiError::Core(CoreError::NameUnknown(path.clone())))?;

    match request {
        RegistryRequest::Manifest { name, reference } => {
            authorize(&state, &headers, &[Access::delete(&name)]).await?;
            let repo = repository(&state, &name)?;
            let reference: ManifestRef = reference.parse()?;
            repo.manifests.delete(&reference).await?;
            notify(&state, EventAction::Delete, &name, None);
            Ok(StatusCode::ACCEPTED.into_response())
        }

        RegistryRequest::Blob { name, digest } => {
            authorize(&state, &headers, &[Access::delete(&name)]).await?;
            let repo = repository(&state, &name)?;
            let digest = parse_digest(&digest)?;
            repo.blobs.delete(&digest).await?;
            notify(&state, EventAction::Delete, &name, None);
            Ok(StatusCode::ACCEPTED.into_response())
        }

        RegistryRequest::Upload { name, id } => {
            authorize(&state, &headers, &[Access::delete(&name)]).await?;
            let repo = repository(&state, &name)?;
            repo.uploads.cancel(&id).await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }

        _ => Err(ApiError::Core(CoreError::Unsupported)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::create_router;
    use crate::state::Services;
    use axum::body::Body;
    use axum::http::Request;
    use drydock_core::{
        Algorithm, ManifestPolicy, ProxyRegistry, ProxyScheduler, Registry, RegistryConfig,
    };
    use drydock_storage::{InMemoryDriver, StorageDriver, paths};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const EMPTY_DIGEST: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn build(read_only: bool, driver: Arc<dyn StorageDriver>) -> Router {
        let registry = Registry::new(
            driver,
            None,
            Arc::new(ManifestPolicy::default()),
            RegistryConfig {
                delete_enabled: true,
                read_only,
                tag_concurrency_limit: 0,
            },
        );
        let state: AppState = Arc::new(Services {
            namespace: Arc::new(registry),
            auth: None,
            events: None,
            redirect_enabled: false,
            metrics: None,
        });
        create_router(state)
    }

    fn fixture() -> (Router, Arc<dyn StorageDriver>) {
        let driver: Arc<dyn StorageDriver> = Arc::new(InMemoryDriver::new());
        (build(false, driver.clone()), driver)
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        router.clone().oneshot(request).await.unwrap()
    }

    async fn body_bytes(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    fn req(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn req_body(method: &str, uri: &str, body: impl Into<Bytes>) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.into()))
            .unwrap()
    }

    fn header_str<'a>(response: &'a Response, name: &str) -> &'a str {
        response.headers().get(name).unwrap().to_str().unwrap()
    }

    /// POST + PUT a blob through the API, returning its digest string
    async fn push_blob(router: &Router, repo: &str, data: &[u8]) -> String {
        let digest = Digest::from_bytes(Algorithm::Sha256, data).to_string();
        let response = send(router, req("POST", &format!("/v2/{repo}/blobs/uploads/"))).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let location = header_str(&response, "location").to_string();
        let response = send(
            router,
            req_body("PUT", &format!("{location}?digest={digest}"), data.to_vec()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        digest
    }

    #[tokio::test]
    async fn version_check_carries_api_version_header() {
        let (router, _) = fixture();
        let response = send(&router, req("GET", "/v2/")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            header_str(&response, "Docker-Distribution-API-Version"),
            "registry/2.0"
        );
    }

    #[tokio::test]
    async fn single_chunk_blob_upload() {
        let (router, _) = fixture();

        let response = send(&router, req("POST", "/v2/alice/app/blobs/uploads/")).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(header_str(&response, "range"), "0-0");
        let uuid = header_str(&response, "Docker-Upload-UUID").to_string();
        let location = header_str(&response, "location").to_string();
        assert_eq!(location, format!("/v2/alice/app/blobs/uploads/{uuid}"));

        let response = send(
            &router,
            req("PUT", &format!("{location}?digest={EMPTY_DIGEST}")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            header_str(&response, "location"),
            format!("/v2/alice/app/blobs/{EMPTY_DIGEST}")
        );
        assert_eq!(header_str(&response, "Docker-Content-Digest"), EMPTY_DIGEST);

        let response = send(
            &router,
            req("HEAD", &format!("/v2/alice/app/blobs/{EMPTY_DIGEST}")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, "content-length"), "0");
    }

    #[tokio::test]
    async fn cross_repo_mount_creates_no_new_blob_file() {
        let (router, driver) = fixture();
        let digest = push_blob(&router, "alice/app", b"shared layer").await;

        let response = send(
            &router,
            req(
                "POST",
                &format!("/v2/bob/app/blobs/uploads/?mount={digest}&from=alice/app"),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            header_str(&response, "location"),
            format!("/v2/bob/app/blobs/{digest}")
        );

        let response = send(&router, req("GET", &format!("/v2/bob/app/blobs/{digest}"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await.as_ref(), b"shared layer");

        // Exactly one file in the blob directory: the shared data file.
        let parsed: Digest = digest.parse().unwrap();
        let blob_dir = paths::blob_path(parsed.algorithm().as_str(), parsed.hex());
        assert_eq!(driver.list(&blob_dir).await.unwrap(), vec![format!("{blob_dir}/data")]);
    }

    #[tokio::test]
    async fn mount_of_unknown_blob_falls_back_to_session() {
        let (router, _) = fixture();
        let ghost = Digest::from_bytes(Algorithm::Sha256, b"never pushed");
        let response = send(
            &router,
            req(
                "POST",
                &format!("/v2/bob/app/blobs/uploads/?mount={ghost}&from=alice/app"),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(response.headers().contains_key("Docker-Upload-UUID"));
    }

    #[tokio::test]
    async fn manifest_put_with_missing_layer_names_the_digest() {
        let (router, _) = fixture();
        let config = push_blob(&router, "alice/app", b"config bytes").await;
        let ghost = format!("sha256:{}", "deadbeef".repeat(8));
        let manifest = format!(
            r#"{{
              "schemaVersion": 2,
              "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
              "config": {{"mediaType": "application/vnd.docker.container.image.v1+json", "size": 12, "digest": "{config}"}},
              "layers": [{{"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "size": 9, "digest": "{ghost}"}}]
            }}"#
        );
        let response = send(
            &router,
            req_body("PUT", "/v2/alice/app/manifests/latest", manifest),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["errors"][0]["code"], "MANIFEST_BLOB_UNKNOWN");
        assert_eq!(body["errors"][0]["detail"]["digest"], ghost);
    }

    #[tokio::test]
    async fn manifest_roundtrip_by_tag_and_digest() {
        let (router, _) = fixture();
        let config = push_blob(&router, "alice/app", b"config bytes").await;
        let layer = push_blob(&router, "alice/app", b"layer bytes").await;
        let manifest = format!(
            r#"{{
              "schemaVersion": 2,
              "mediaType": "application/vnd.oci.image.manifest.v1+json",
              "config": {{"mediaType": "application/vnd.oci.image.config.v1+json", "size": 12, "digest": "{config}"}},
              "layers": [{{"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "size": 11, "digest": "{layer}"}}]
            }}"#
        );
        let response = send(
            &router,
            req_body("PUT", "/v2/alice/app/manifests/v1.0", manifest.clone()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let digest = header_str(&response, "Docker-Content-Digest").to_string();

        let response = send(&router, req("GET", "/v2/alice/app/manifests/v1.0")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, "Docker-Content-Digest"), digest);
        assert_eq!(body_bytes(response).await.as_ref(), manifest.as_bytes());

        let response = send(
            &router,
            req("GET", &format!("/v2/alice/app/manifests/{digest}")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&router, req("GET", "/v2/alice/app/tags/list")).await;
        let body = body_json(response).await;
        assert_eq!(body["tags"], serde_json::json!(["v1.0"]));
    }

    #[tokio::test]
    async fn bad_upload_range_is_416_and_preserves_offset() {
        let (router, _) = fixture();
        let response = send(&router, req("POST", "/v2/alice/app/blobs/uploads/")).await;
        let location = header_str(&response, "location").to_string();

        let mut patch = req_body("PATCH", &location, vec![0u8; 100]);
        patch
            .headers_mut()
            .insert(header::CONTENT_RANGE, HeaderValue::from_static("0-99"));
        let response = send(&router, patch).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(header_str(&response, "range"), "0-99");

        let mut patch = req_body("PATCH", &location, vec![0u8; 100]);
        patch
            .headers_mut()
            .insert(header::CONTENT_RANGE, HeaderValue::from_static("50-149"));
        let response = send(&router, patch).await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        let body = body_json(response).await;
        assert_eq!(body["errors"][0]["code"], "BLOB_UPLOAD_INVALID");

        // Session still at offset 100.
        let response = send(&router, req("GET", &location)).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(header_str(&response, "range"), "0-99");
    }

    #[tokio::test]
    async fn read_only_mode_rejects_writes_but_serves_reads() {
        let driver: Arc<dyn StorageDriver> = Arc::new(InMemoryDriver::new());
        let rw = build(false, driver.clone());
        let digest = push_blob(&rw, "alice/app", b"existing").await;

        let ro = build(true, driver);
        let response = send(&ro, req("POST", "/v2/x/blobs/uploads/")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        let body = body_json(response).await;
        assert_eq!(body["errors"][0]["code"], "UNSUPPORTED");

        let response = send(&ro, req("GET", &format!("/v2/alice/app/blobs/{digest}"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await.as_ref(), b"existing");
    }

    #[tokio::test]
    async fn ranged_blob_get_returns_partial_content() {
        let (router, _) = fixture();
        let digest = push_blob(&router, "alice/app", b"0123456789").await;

        let mut request = req("GET", &format!("/v2/alice/app/blobs/{digest}"));
        request
            .headers_mut()
            .insert(header::RANGE, HeaderValue::from_static("bytes=2-5"));
        let response = send(&router, request).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header_str(&response, "content-range"), "bytes 2-5/10");
        assert_eq!(body_bytes(response).await.as_ref(), b"2345");
    }

    #[tokio::test]
    async fn catalog_paginates_with_link_header() {
        let (router, _) = fixture();
        for repo in ["a/one", "b/two", "c/three"] {
            push_blob(&router, repo, b"seed").await;
        }

        let response = send(&router, req("GET", "/v2/_catalog?n=2")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            header_str(&response, "link"),
            "</v2/_catalog?last=b/two&n=2>; rel=\"next\""
        );
        let body = body_json(response).await;
        assert_eq!(body["repositories"], serde_json::json!(["a/one", "b/two"]));

        let response = send(&router, req("GET", "/v2/_catalog?n=2&last=b/two")).await;
        let body = body_json(response).await;
        assert_eq!(body["repositories"], serde_json::json!(["c/three"]));
    }

    #[tokio::test]
    async fn missing_auth_yields_challenge() {
        let driver: Arc<dyn StorageDriver> = Arc::new(InMemoryDriver::new());
        let registry = Registry::new(
            driver,
            None,
            Arc::new(ManifestPolicy::default()),
            RegistryConfig::default(),
        );
        let state: AppState = Arc::new(Services {
            namespace: Arc::new(registry),
            auth: Some(Arc::new(drydock_auth::SillyAccessController::new(
                "http://auth",
                "registry",
            ))),
            events: None,
            redirect_enabled: false,
            metrics: None,
        });
        let router = create_router(state);

        let response = send(&router, req("GET", "/v2/")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(header_str(&response, "www-authenticate").contains("realm="));
        let body = body_json(response).await;
        assert_eq!(body["errors"][0]["code"], "UNAUTHORIZED");

        let mut authed = req("GET", "/v2/");
        authed
            .headers_mut()
            .insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer x"));
        let response = send(&router, authed).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_digest_in_blob_path_is_rejected() {
        let (router, _) = fixture();
        let response = send(&router, req("GET", "/v2/alice/app/blobs/sha256:nothex")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["errors"][0]["code"], "DIGEST_INVALID");
    }

    // ==================== Pull-through cache ====================

    fn upstream_router(blob: Bytes, digest: String) -> Router {
        Router::new()
            .route(
                "/v2/",
                get(|| async { ([(header::CONTENT_TYPE, "application/json")], "{}") }),
            )
            .route(
                "/v2/{*path}",
                get(move |Path(path): Path<String>| {
                    let blob = blob.clone();
                    let digest = digest.clone();
                    async move {
                        if path.ends_with(&format!("blobs/{digest}")) {
                            blob.into_response()
                        } else {
                            StatusCode::NOT_FOUND.into_response()
                        }
                    }
                }),
            )
    }

    #[tokio::test]
    async fn pull_through_miss_then_local_hit() {
        let blob = Bytes::from_static(b"upstream layer bytes");
        let digest = Digest::from_bytes(Algorithm::Sha256, &blob).to_string();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let upstream = tokio::spawn(
            axum::serve(listener, upstream_router(blob.clone(), digest.clone())).into_future(),
        );

        let driver: Arc<dyn StorageDriver> = Arc::new(InMemoryDriver::new());
        let local = Registry::new(
            driver.clone(),
            None,
            Arc::new(ManifestPolicy::default()),
            RegistryConfig::default(),
        );
        let remote = Arc::new(
            drydock_proxy::RemoteClient::new(drydock_proxy::RemoteConfig {
                url: format!("http://{addr}"),
                username: None,
                password: None,
                timeout: Duration::from_secs(5),
            })
            .unwrap(),
        );
        let scheduler = Arc::new(ProxyScheduler::load(driver.clone()).await);
        let proxy = ProxyRegistry::new(local, remote, scheduler, None);
        let state: AppState = Arc::new(Services {
            namespace: Arc::new(proxy),
            auth: None,
            events: None,
            redirect_enabled: false,
            metrics: None,
        });
        let router = create_router(state);

        // Miss: bytes stream through from the upstream.
        let response = send(&router, req("GET", &format!("/v2/lib/nginx/blobs/{digest}"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, blob);

        // Writes through the proxy are unsupported.
        let response = send(&router, req("POST", "/v2/lib/nginx/blobs/uploads/")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        // Kill the upstream; once the spool task commits, the blob serves
        // locally.
        upstream.abort();
        let mut served_locally = None;
        for _ in 0..100 {
            let response =
                send(&router, req("GET", &format!("/v2/lib/nginx/blobs/{digest}"))).await;
            if response.status() == StatusCode::OK {
                served_locally = Some(body_bytes(response).await);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(served_locally.expect("blob never materialized locally"), blob);
    }
}
