//! API error types
//!
//! Every error leaving a handler is rendered as the OCI error envelope:
//! `{"errors":[{"code":..., "message":..., "detail":...}]}` with the status
//! the distribution spec expects for that code.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{error, warn};

use drydock_core::CoreError;

#[derive(Error, Debug)]
pub enum ApiError {
    /// 401 with the controller's `WWW-Authenticate` header
    #[error("authentication required")]
    Challenge { header: String },

    /// 403: authenticated but not permitted
    #[error("access denied")]
    Denied,

    /// Access controller failed in a way that is not the client's business;
    /// 400 with an empty body so configuration details never leak.
    #[error("access controller error")]
    AuthInternal,

    #[error("{0}")]
    Core(#[from] CoreError),

    /// Malformed request surface (bad query parameter, bad header)
    #[error("bad request: {0}")]
    BadRequest(String),
}

struct Rendered {
    status: StatusCode,
    errors: Vec<(&'static str, String, Value)>,
}

fn render_core(err: &CoreError) -> Rendered {
    let one = |status, code: &'static str, message: String, detail| Rendered {
        status,
        errors: vec![(code, message, detail)],
    };
    match err {
        CoreError::Storage(e) => {
            error!("storage failure: {}", e);
            one(
                StatusCode::INTERNAL_SERVER_ERROR,
                "UNKNOWN",
                "internal error".to_string(),
                Value::Null,
            )
        }
        CoreError::Cache(e) => {
            error!("descriptor cache failure: {}", e);
            one(
                StatusCode::INTERNAL_SERVER_ERROR,
                "UNKNOWN",
                "internal error".to_string(),
                Value::Null,
            )
        }
        CoreError::Upstream(e) => {
            warn!("upstream failure: {}", e);
            one(
                StatusCode::BAD_GATEWAY,
                "UNKNOWN",
                "upstream registry unavailable".to_string(),
                Value::Null,
            )
        }
        CoreError::DigestInvalid(msg) => one(
            StatusCode::BAD_REQUEST,
            "DIGEST_INVALID",
            msg.clone(),
            Value::Null,
        ),
        CoreError::NameInvalid(name) => one(
            StatusCode::BAD_REQUEST,
            "NAME_INVALID",
            "invalid repository name".to_string(),
            json!({"name": name}),
        ),
        CoreError::NameUnknown(name) => one(
            StatusCode::NOT_FOUND,
            "NAME_UNKNOWN",
            "repository name not known to registry".to_string(),
            json!({"name": name}),
        ),
        CoreError::TagInvalid(tag) => one(
            StatusCode::BAD_REQUEST,
            "TAG_INVALID",
            "invalid tag".to_string(),
            json!({"tag": tag}),
        ),
        CoreError::BlobUnknown(digest) => one(
            StatusCode::NOT_FOUND,
            "BLOB_UNKNOWN",
            "blob unknown to registry".to_string(),
            json!({"digest": digest.to_string()}),
        ),
        CoreError::BlobUploadUnknown(id) => one(
            StatusCode::NOT_FOUND,
            "BLOB_UPLOAD_UNKNOWN",
            "blob upload unknown to registry".to_string(),
            json!({"uuid": id}),
        ),
        CoreError::BlobUploadInvalid(msg) => one(
            StatusCode::BAD_REQUEST,
            "BLOB_UPLOAD_INVALID",
            msg.clone(),
            Value::Null,
        ),
        CoreError::RangeInvalid { expected, provided } => one(
            StatusCode::RANGE_NOT_SATISFIABLE,
            "BLOB_UPLOAD_INVALID",
            format!("offset {provided} does not match upload offset {expected}"),
            Value::Null,
        ),
        CoreError::SizeInvalid { expected, actual } => one(
            StatusCode::BAD_REQUEST,
            "SIZE_INVALID",
            format!("expected {expected} bytes, got {actual}"),
            Value::Null,
        ),
        CoreError::ManifestUnknown { reference } => one(
            StatusCode::NOT_FOUND,
            "MANIFEST_UNKNOWN",
            "manifest unknown".to_string(),
            json!({"reference": reference}),
        ),
        CoreError::ManifestInvalid(msg) => one(
            StatusCode::BAD_REQUEST,
            "MANIFEST_INVALID",
            msg.clone(),
            Value::Null,
        ),
        CoreError::ManifestBlobsUnknown(missing) => Rendered {
            status: StatusCode::BAD_REQUEST,
            errors: missing
                .iter()
                .map(|digest| {
                    (
                        "MANIFEST_BLOB_UNKNOWN",
                        "manifest references a blob unknown to the repository".to_string(),
                        json!({"digest": digest.to_string()}),
                    )
                })
                .collect(),
        },
        CoreError::Unsupported => one(
            StatusCode::METHOD_NOT_ALLOWED,
            "UNSUPPORTED",
            "the operation is unsupported".to_string(),
            Value::Null,
        ),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let rendered = match &self {
            ApiError::Challenge { header } => {
                let body = axum::Json(json!({
                    "errors": [{"code": "UNAUTHORIZED", "message": "authentication required", "detail": Value::Null}]
                }));
                let mut response = (StatusCode::UNAUTHORIZED, body).into_response();
                if let Ok(value) = HeaderValue::from_str(header) {
                    response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
                }
                return response;
            }
            ApiError::Denied => Rendered {
                status: StatusCode::FORBIDDEN,
                errors: vec![(
                    "DENIED",
                    "requested access to the resource is denied".to_string(),
                    Value::Null,
                )],
            },
            ApiError::AuthInternal => {
                // Deliberately bodyless.
                return StatusCode::BAD_REQUEST.into_response();
            }
            ApiError::Core(err) => render_core(err),
            ApiError::BadRequest(msg) => Rendered {
                status: StatusCode::BAD_REQUEST,
                errors: vec![("BLOB_UPLOAD_INVALID", msg.clone(), Value::Null)],
            },
        };

        let errors: Vec<Value> = rendered
            .errors
            .into_iter()
            .map(|(code, message, detail)| json!({"code": code, "message": message, "detail": detail}))
            .collect();
        (rendered.status, axum::Json(json!({ "errors": errors }))).into_response()
    }
}
