//! Pluggable route registration for the admin surface (`/metrics`,
//! `/healthz`) that rides alongside the proxy fallback on the same
//! listeners.

pub mod healthz;
pub mod metrics;

use crate::http::server::Transport;
use std::sync::Arc;

pub use healthz::HealthzController;
pub use metrics::MetricsController;

/// Registers one or more named routes onto the shared router.
pub trait Controller: Send + Sync {
    fn register(&self, router: axum::Router<Arc<Transport>>) -> axum::Router<Arc<Transport>>;
}
