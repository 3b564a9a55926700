//! Route assembly

mod health;
mod metrics;
pub mod registry;

use axum::Router;
use axum::http::HeaderValue;
use axum::response::Response;

use crate::state::AppState;

/// Every response names the API version the registry speaks.
const API_VERSION_HEADER: &str = "Docker-Distribution-API-Version";
const API_VERSION: &str = "registry/2.0";

/// Build the full router: the OCI v2 surface plus liveness and metrics.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(registry::routes())
        .merge(health::routes())
        .merge(metrics::routes())
        .layer(axum::middleware::map_response(add_version_header))
        .with_state(state)
}

async fn add_version_header(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));
    response
}
