//! Active monitor: subscribes to dead-backend gossip and cooperatively
//! (via a store-backed lease) probes upstreams back to health.

use crate::http::client::hyper_client::{self, HyperClient};
use crate::http::client::hyper_client::BoxError;
use crate::store::{DeadNotice, StoreError, StoreFacade, PROBE_LEASE_TTL};
use futures::StreamExt;
use http_body_util::{BodyExt, Empty};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const PROBE_TOTAL_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_CONCURRENT_PROBES: usize = 5;
/// Upper bound on simultaneously in-flight monitor tasks, used only as the
/// `tasks` wait-group's total permit count (not a concurrency limit —
/// that's `semaphore`/`MAX_CONCURRENT_PROBES`).
const MAX_TRACKED_TASKS: u32 = 1_000_000;

type DedupKey = (String, String);

pub struct ActiveMonitor {
    store: Arc<dyn StoreFacade>,
    client: HyperClient,
    holder_id: String,
    dedup: Mutex<HashSet<DedupKey>>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
    tasks: Arc<Semaphore>,
}

impl ActiveMonitor {
    pub fn new(store: Arc<dyn StoreFacade>, shutdown: CancellationToken) -> Self {
        let holder_id = hostname().unwrap_or_else(random_holder_id);
        Self {
            store,
            client: hyper_client::create_probe_client(),
            holder_id,
            dedup: Mutex::new(HashSet::new()),
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES)),
            shutdown,
            tasks: Arc::new(Semaphore::new(MAX_TRACKED_TASKS as usize)),
        }
    }

    /// Subscribes to the dead-notice stream and dispatches a task per
    /// distinct `(host, upstream_url)` pair. Runs until the shutdown token
    /// fires.
    pub async fn run(self: Arc<Self>) {
        let mut stream = match self.store.subscribe().await {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    component = "router",
                    scope = "monitor",
                    event = "subscribe_failed",
                    error = %e,
                    "active monitor failed to subscribe to dead-notice channel"
                );
                return;
            }
        };

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                notice = stream.next() => {
                    match notice {
                        Some(notice) => self.clone().dispatch(notice),
                        None => break,
                    }
                }
            }
        }

        // Wait for in-flight tasks to observe cancellation before returning.
        self.stop().await;
    }

    fn dispatch(self: Arc<Self>, notice: DeadNotice) {
        let key = (notice.host.clone(), notice.upstream_url.clone());
        {
            let mut dedup = self.dedup.lock().unwrap();
            if dedup.contains(&key) {
                debug!(
                    component = "router",
                    scope = "monitor",
                    event = "duplicate_notice_discarded",
                    host = %notice.host,
                    backend = %notice.upstream_url,
                    "duplicate dead notice discarded"
                );
                return;
            }
            dedup.insert(key.clone());
        }

        let permit = match self.tasks.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    component = "router",
                    scope = "monitor",
                    event = "task_tracking_exhausted",
                    host = %key.0,
                    backend = %key.1,
                    "dropping dead notice: too many in-flight monitor tasks"
                );
                self.dedup.lock().unwrap().remove(&key);
                return;
            }
        };
        let monitor = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            crate::metrics::inc_active_probe_tasks();
            monitor.probe_task(notice, key).await;
            crate::metrics::dec_active_probe_tasks();
        });
    }

    async fn probe_task(&self, notice: DeadNotice, key: DedupKey) {
        if !self.claim(&notice).await {
            return;
        }
        crate::metrics::add_lease_acquired(1);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(PROBE_INTERVAL) => {}
            }
            if self.shutdown.is_cancelled() {
                break;
            }

            let _permit = self.semaphore.acquire().await.expect("semaphore not closed");

            if !self
                .store
                .acquire_lease(&notice.host, &notice.upstream_url, &self.holder_id, PROBE_LEASE_TTL)
                .await
                .unwrap_or(false)
            {
                break;
            }

            let ok = self.probe_once(&notice).await;
            let store_result = if ok {
                self.store.clear_dead(&notice.host, &notice.upstream_url).await
            } else {
                self.store.re_add_dead(&notice.host, &notice.upstream_url).await
            };

            match store_result {
                Ok(()) => {
                    if ok {
                        break;
                    }
                }
                Err(StoreError::BackendNotInList) => break,
                Err(e) => {
                    crate::dedlog::err(
                        Some(&e),
                        Some(&format!("host={} backend={}", notice.host, notice.upstream_url)),
                        "active monitor store update failed",
                    );
                }
            }
        }

        let _ = self.store.release_lease(&notice.host, &notice.upstream_url).await;
        self.dedup.lock().unwrap().remove(&key);
    }

    async fn claim(&self, notice: &DeadNotice) -> bool {
        match self
            .store
            .acquire_lease(&notice.host, &notice.upstream_url, &self.holder_id, PROBE_LEASE_TTL)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                self.dedup
                    .lock()
                    .unwrap()
                    .remove(&(notice.host.clone(), notice.upstream_url.clone()));
                false
            }
            Err(e) => {
                crate::dedlog::err(
                    Some(&e),
                    Some(&format!("host={} backend={}", notice.host, notice.upstream_url)),
                    "active monitor failed to claim probe lease",
                );
                self.dedup
                    .lock()
                    .unwrap()
                    .remove(&(notice.host.clone(), notice.upstream_url.clone()));
                false
            }
        }
    }

    async fn probe_once(&self, notice: &DeadNotice) -> bool {
        let spec = match self.store.read_health_spec(&notice.host).await {
            Ok(spec) => spec,
            Err(_) => return false,
        };

        let path = spec.path.trim_start_matches('/');
        let mut url = format!("{}/{}", notice.upstream_url.trim_end_matches('/'), path);
        if !url.starts_with("http://") && !url.starts_with("https://") {
            url = format!("http://{}", url);
        }

        let req = match hyper::Request::builder()
            .method("GET")
            .uri(&url)
            .body(Empty::<hyper::body::Bytes>::new().map_err(|never: std::convert::Infallible| -> BoxError { match never {} }).boxed())
        {
            Ok(req) => req,
            Err(_) => return false,
        };

        let result = tokio::time::timeout(PROBE_TOTAL_TIMEOUT, self.client.request(req)).await;
        let response = match result {
            Ok(Ok(resp)) => resp,
            _ => return false,
        };

        if spec.expected_status != 0 && response.status().as_u16() != spec.expected_status {
            return false;
        }

        if spec.expected_body_substring.is_empty() {
            return true;
        }

        let body = match response.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => return false,
        };
        String::from_utf8_lossy(&body).contains(&spec.expected_body_substring)
    }

    /// Waits for all in-flight probe tasks to finish after a cancellation
    /// has been observed. No task survives past this call returning.
    pub async fn stop(&self) {
        // Every in-flight task holds one permit for its lifetime; this only
        // succeeds once all of them have been released, i.e. every task has
        // actually completed.
        let _ = self.tasks.acquire_many(MAX_TRACKED_TASKS).await;
        info!(
            component = "router",
            scope = "monitor",
            event = "stopped",
            "active monitor drained all probe tasks"
        );
    }
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty())
}

fn random_holder_id() -> String {
    format!("roxxy-{:08x}", rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FakeStore;

    fn notice(host: &str, upstream: &str) -> DeadNotice {
        DeadNotice {
            host: host.to_string(),
            upstream_url: upstream.to_string(),
            position: 0,
            list_len: 1,
        }
    }

    #[tokio::test]
    async fn claim_succeeds_when_the_lease_is_free() {
        let store = Arc::new(FakeStore::new());
        let monitor = ActiveMonitor::new(store, CancellationToken::new());

        assert!(monitor.claim(&notice("h", "u")).await);
    }

    #[tokio::test]
    async fn claim_fails_when_another_holder_owns_the_lease() {
        let store = Arc::new(FakeStore::new());
        store
            .acquire_lease("h", "u", "some-other-instance", PROBE_LEASE_TTL)
            .await
            .unwrap();
        let monitor = ActiveMonitor::new(store, CancellationToken::new());

        assert!(!monitor.claim(&notice("h", "u")).await);
    }

    #[tokio::test]
    async fn dispatch_discards_a_duplicate_notice_for_an_in_flight_pair() {
        tokio::time::pause();
        let store = Arc::new(FakeStore::new());
        store.set_frontend("h", "label", vec!["http://127.0.0.1:1".to_string()]).await;
        let monitor = Arc::new(ActiveMonitor::new(store.clone(), CancellationToken::new()));

        monitor.clone().dispatch(notice("h", "http://127.0.0.1:1"));
        // Give the spawned task a chance to claim the lease and register the
        // dedup entry before the duplicate notice arrives.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(monitor.dedup.lock().unwrap().contains(&("h".to_string(), "http://127.0.0.1:1".to_string())));

        // A duplicate dispatched now must not acquire a second tracked-task
        // permit: only one task is in flight for this pair.
        let before = monitor.tasks.available_permits();
        monitor.clone().dispatch(notice("h", "http://127.0.0.1:1"));
        tokio::task::yield_now().await;
        assert_eq!(monitor.tasks.available_permits(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_an_in_flight_probe_task_to_finish() {
        let store = Arc::new(FakeStore::new());
        store.set_frontend("h", "label", vec!["http://127.0.0.1:1".to_string()]).await;
        let monitor = Arc::new(ActiveMonitor::new(store, CancellationToken::new()));

        monitor.clone().dispatch(notice("h", "http://127.0.0.1:1"));
        tokio::task::yield_now().await;
        assert!(monitor.dedup.lock().unwrap().contains(&("h".to_string(), "http://127.0.0.1:1".to_string())));

        // Advance past the probe interval and the probe's own total timeout
        // so the in-flight task actually finishes (the probe target isn't
        // listening, so it fails and the task keeps looping until the lease
        // can't be refreshed or time is advanced enough for a few rounds).
        monitor.shutdown.cancel();
        tokio::time::advance(PROBE_INTERVAL + PROBE_TOTAL_TIMEOUT).await;

        monitor.stop().await;
        assert!(monitor.dedup.lock().unwrap().is_empty());
    }
}
