// Proxy process bootstrap for integration tests: a real `App` wired to a
// `FakeStore`, listening on a real (loopback) socket.

use crate::app::App;
use crate::config::{self, ConfigTrait, Listen};
use crate::liveness;
use crate::store::FakeStore;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Grabs a free loopback port by binding then immediately dropping the
/// listener. `Transport` rebinds the same address right after.
fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub struct ProxyProcess {
    pub addr: String,
    pub store: Arc<FakeStore>,
    shutdown_token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyProcess {
    /// Starts the proxy against a fresh `FakeStore` and waits until it
    /// answers `/healthz`.
    pub async fn start() -> Self {
        let port = free_port();
        let addr = format!("127.0.0.1:{}", port);

        let mut cfg = config::new_test_config();
        cfg.roxxy.listen = vec![Listen {
            addr: addr.clone(),
            tls: false,
        }];

        let store = Arc::new(FakeStore::new());
        let shutdown_token = CancellationToken::new();
        let probe = Arc::new(liveness::Probe::new(Duration::from_secs(1))) as Arc<dyn liveness::Prober>;

        let app = App::new_with_store(shutdown_token.clone(), cfg, probe, store.clone())
            .await
            .expect("failed to build test app");

        let graceful = Arc::new(crate::shutdown::GracefulShutdown::new(shutdown_token.clone()));
        graceful.add(1);
        let graceful_clone = graceful.clone();
        let handle = tokio::spawn(async move {
            let _ = app.serve(graceful_clone).await;
        });

        let base = format!("http://{}", addr);
        wait_ready(&format!("{}/healthz", base)).await;

        Self {
            addr: base,
            store,
            shutdown_token,
            handle,
        }
    }

    pub async fn stop(self) {
        self.shutdown_token.cancel();
        self.handle.abort();
    }
}

async fn wait_ready(url: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if let Ok(resp) = reqwest::get(url).await {
            if resp.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("proxy never became ready at {}", url);
}
