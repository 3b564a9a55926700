//! Drydock HTTP API
//!
//! The axum-based OCI Distribution v2 surface: route dispatch, access-record
//! assembly and the authorization callout, and the mapping from core errors
//! onto the OCI error envelope.

pub mod error;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::{AppState, MetricsHandle, Services};
