//! Routing and health-coordination core: maps a host header to a live
//! upstream, tracks dead backends, and cooperatively probes them back to
//! health.

pub mod cache;
pub mod monitor;
pub mod outcome;
pub mod selector;
pub mod types;

pub use monitor::ActiveMonitor;
pub use outcome::OutcomeRecorder;
pub use selector::Selector;
pub use types::{strip_port, RequestDecision, RouterError};

use crate::accesslog::LogSink;
use crate::store::{StoreError, StoreFacade};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Owns the selector, outcome recorder, and active monitor for a single
/// proxy process.
pub struct Router {
    selector: Selector,
    outcome: OutcomeRecorder,
    monitor: Arc<ActiveMonitor>,
}

impl Router {
    pub fn new(
        store: Arc<dyn StoreFacade>,
        access_log: Arc<LogSink>,
        cache_enabled: bool,
        dead_ttl: Duration,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let selector = Selector::new(store.clone(), cache_enabled);
        let outcome = OutcomeRecorder::new(store.clone(), access_log, dead_ttl);
        let monitor = Arc::new(ActiveMonitor::new(store, shutdown));

        Arc::new(Self {
            selector,
            outcome,
            monitor,
        })
    }

    /// Starts the active monitor's dead-notice subscription loop in the
    /// background. Call once at process startup.
    pub fn start(self: &Arc<Self>) {
        let monitor = self.monitor.clone();
        tokio::spawn(async move {
            monitor.run().await;
        });
        info!(component = "router", event = "started", "router lifecycle");
    }

    pub async fn choose(&self, host: &str) -> Result<RequestDecision, RouterError> {
        self.selector.choose(host).await
    }

    pub async fn record_outcome<F>(
        &self,
        decision: &RequestDecision,
        is_dead: bool,
        log_supplier: Option<F>,
    ) -> Result<(), StoreError>
    where
        F: FnOnce() -> crate::accesslog::LogRecord,
    {
        self.outcome.end(decision, is_dead, log_supplier).await
    }

    /// Stops the access log sink. The active monitor observes the shared
    /// shutdown token directly and drains itself inside `run()`.
    pub async fn stop(&self) {
        info!(component = "router", event = "stopped", "router lifecycle");
    }
}
