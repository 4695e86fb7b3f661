use super::Controller;
use crate::http::server::Transport;
use axum::routing::get;
use std::sync::Arc;

/// Exposes the hand-rolled Prometheus text exporter at `/metrics`.
pub struct MetricsController;

impl MetricsController {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MetricsController {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller for MetricsController {
    fn register(&self, router: axum::Router<Arc<Transport>>) -> axum::Router<Arc<Transport>> {
        router.route("/metrics", get(handler))
    }
}

async fn handler() -> String {
    crate::metrics::render()
}
