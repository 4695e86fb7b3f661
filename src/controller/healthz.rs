use super::Controller;
use crate::http::server::Transport;
use crate::liveness::Prober;
use axum::http::StatusCode;
use axum::routing::get;
use std::sync::Arc;

/// Process-liveness endpoint, independent of the store-health `__ping__`
/// virtual host: this answers whether the HTTP server itself is alive.
pub struct HealthzController {
    prober: Arc<dyn Prober>,
}

impl HealthzController {
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self { prober }
    }
}

impl Controller for HealthzController {
    fn register(&self, router: axum::Router<Arc<Transport>>) -> axum::Router<Arc<Transport>> {
        let prober = self.prober.clone();
        router.route(
            "/healthz",
            get(move || {
                let prober = prober.clone();
                async move {
                    if prober.is_alive() {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                }
            }),
        )
    }
}
