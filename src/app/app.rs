// Main application wiring: store, router, access log and transport.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::accesslog::LogSink;
use crate::config::{Config, ConfigTrait};
use crate::controller::{Controller, HealthzController, MetricsController};
use crate::http::server::Transport;
use crate::liveness;
use crate::router::Router;
use crate::store::{RedisStore, StoreFacade};
use crate::traces;

/// Encapsulates the entire proxy application state.
pub struct App {
    cfg: Config,
    shutdown_token: CancellationToken,
    store: Arc<dyn StoreFacade>,
    router: Arc<Router>,
    probe: Arc<dyn liveness::Prober>,
    cancel_observer: Option<Arc<dyn Fn(CancellationToken) -> Result<()> + Send + Sync>>,
    transport: Arc<Transport>,
    started: Arc<AtomicBool>,
}

impl App {
    /// Creates a new application instance backed by Redis.
    pub async fn new(
        shutdown_token: CancellationToken,
        cfg: Config,
        probe: Arc<dyn liveness::Prober>,
    ) -> Result<Self> {
        let store: Arc<dyn StoreFacade> =
            Arc::new(RedisStore::connect(&cfg.redis().read, &cfg.redis().write).await?);
        Self::new_with_store(shutdown_token, cfg, probe, store).await
    }

    /// Creates a new application instance against a caller-supplied store,
    /// bypassing the Redis connection. Used by the test harness.
    pub async fn new_with_store(
        shutdown_token: CancellationToken,
        cfg: Config,
        probe: Arc<dyn liveness::Prober>,
        store: Arc<dyn StoreFacade>,
    ) -> Result<Self> {
        let access_log = LogSink::start(
            cfg.access_log().and_then(|a| a.path.as_deref()),
            shutdown_token.clone(),
        );

        let router = Router::new(
            store.clone(),
            access_log.clone(),
            cfg.is_cache_enabled(),
            cfg.router().dead_backend_ttl,
            shutdown_token.clone(),
        );

        let controllers: Vec<Box<dyn Controller>> = vec![
            Box::new(MetricsController::new()),
            Box::new(HealthzController::new(probe.clone())),
        ];

        let transport = Transport::new(cfg.clone(), store.clone(), router.clone(), access_log, controllers);

        let cancel_observer = traces::apply(shutdown_token.clone(), cfg.traces().cloned());
        let cancel_observer_arc = Arc::new(cancel_observer);

        Ok(Self {
            cfg,
            shutdown_token,
            probe,
            store,
            router,
            transport,
            cancel_observer: Some(cancel_observer_arc),
            started: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Serves the proxy and probes, handles graceful shutdown.
    pub async fn serve(&self, gsh: Arc<crate::shutdown::GracefulShutdown>) -> Result<()> {
        self.probe
            .watch(vec![Arc::new(self.clone()) as Arc<dyn liveness::Service>]);

        self.router.start();
        self.started.store(true, Ordering::Relaxed);

        let transport = self.transport.clone();
        let shutdown = self.shutdown_token.clone();
        let app_for_close = self.clone();
        let gsh_clone = gsh.clone();

        tokio::task::spawn(async move {
            if let Err(e) = transport.serve(shutdown).await {
                error!(
                    component = "app",
                    scope = "transport",
                    event = "serve_failed",
                    error = %e,
                    "transport failed to serve"
                );
            }

            if let Err(e) = app_for_close.close().await {
                error!(
                    component = "app",
                    scope = "shutdown",
                    event = "close_failed",
                    error = %e,
                    "application close failed"
                );
            }

            gsh_clone.done();
        });

        info!(component = "app", event = "started", "application lifecycle");

        Ok(())
    }

    /// Checks whether the application has started serving and not yet been shut down.
    pub fn is_alive(&self) -> bool {
        if !self.started.load(Ordering::Relaxed) {
            return false;
        }
        if self.shutdown_token.is_cancelled() {
            warn!(
                component = "app",
                scope = "transport",
                event = "gone_away",
                "application has been shut down"
            );
            return false;
        }
        true
    }

    /// Closes application resources.
    pub async fn close(&self) -> Result<()> {
        if let Some(cb) = &self.cancel_observer {
            if let Err(e) = cb.as_ref()(self.shutdown_token.clone()) {
                error!(
                    component = "app",
                    scope = "observability",
                    event = "close_failed",
                    error = %e,
                    "error closing observer"
                );
            }
        }

        self.router.stop().await;
        self.shutdown_token.cancel();

        info!(component = "app", event = "stopped", "application lifecycle");

        Ok(())
    }
}

impl Clone for App {
    fn clone(&self) -> Self {
        Self {
            cfg: self.cfg.clone(),
            shutdown_token: self.shutdown_token.clone(),
            store: self.store.clone(),
            router: self.router.clone(),
            probe: self.probe.clone(),
            cancel_observer: self.cancel_observer.clone(),
            transport: self.transport.clone(),
            started: self.started.clone(),
        }
    }
}

impl liveness::Service for App {
    fn is_alive(&self, _timeout: Duration) -> bool {
        self.is_alive()
    }
}
