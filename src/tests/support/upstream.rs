// Fake upstream server for integration tests: answers fixed or
// toggleable responses so scenarios can exercise routing and failover
// without a real backend.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

struct UpstreamState {
    healthy: AtomicBool,
    hits: AtomicUsize,
    body: String,
}

/// A single fake backend process, listening on its own `127.0.0.1` port.
pub struct FakeUpstream {
    addr: String,
    state: Arc<UpstreamState>,
    handle: JoinHandle<()>,
    shutdown: tokio::sync::oneshot::Sender<()>,
}

impl FakeUpstream {
    /// Starts a fake upstream that answers `200 body` on `/` and
    /// `200`/`503` on `/healthz` depending on `set_healthy`.
    pub async fn start(body: &str) -> Self {
        let state = Arc::new(UpstreamState {
            healthy: AtomicBool::new(true),
            hits: AtomicUsize::new(0),
            body: body.to_string(),
        });

        let router = Router::new()
            .route("/healthz", get(healthz))
            .route("/", get(root))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, router);
            tokio::select! {
                _ = server => {},
                _ = shutdown_rx => {},
            }
        });

        Self {
            addr: format!("http://127.0.0.1:{}", addr.port()),
            state,
            handle,
            shutdown: shutdown_tx,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::Relaxed)
    }

    pub async fn close(self) {
        let _ = self.shutdown.send(());
        self.handle.abort();
    }
}

async fn root(State(state): State<Arc<UpstreamState>>) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::Relaxed);
    state.body.clone()
}

async fn healthz(State(state): State<Arc<UpstreamState>>) -> impl IntoResponse {
    if state.healthy.load(Ordering::Relaxed) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "down")
    }
}
