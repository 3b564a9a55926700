//! Application state
//!
//! [`Services`] is the immutable value built once at startup; request
//! handlers receive it behind an `Arc` and attach nothing to it. Everything
//! mutable lives inside the individual services.

use drydock_auth::AccessController;
use drydock_core::{Broadcaster, Namespace};
use std::sync::Arc;

/// Type alias for the Prometheus metrics handle
pub type MetricsHandle = metrics_exporter_prometheus::PrometheusHandle;

/// Process-wide services assembled at startup
pub struct Services {
    pub namespace: Arc<dyn Namespace>,
    /// Absent means an open registry (no authorization callout)
    pub auth: Option<Arc<dyn AccessController>>,
    /// Absent means notifications are disabled
    pub events: Option<Broadcaster>,
    /// Allow 307 redirects to driver-signed URLs for blob downloads
    pub redirect_enabled: bool,
    pub metrics: Option<Arc<MetricsHandle>>,
}

/// Shared handle handed to every request handler
pub type AppState = Arc<Services>;
