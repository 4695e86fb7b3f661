//! Round-robin selection over a host's live upstreams.

use super::cache::BackendSetCache;
use super::types::{strip_port, RequestDecision, RouterError};
use crate::store::{BackendListing, StoreFacade};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

pub struct Selector {
    store: Arc<dyn StoreFacade>,
    cache: Option<BackendSetCache>,
    counters: RwLock<HashMap<String, Arc<AtomicU32>>>,
}

impl Selector {
    pub fn new(store: Arc<dyn StoreFacade>, cache_enabled: bool) -> Self {
        Self {
            store,
            cache: cache_enabled.then(BackendSetCache::new),
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Fetches the `(label, upstreams, dead)` tuple for `host`, via the
    /// cache when enabled, directly from the store otherwise.
    async fn fetch(&self, host: &str) -> Result<(String, Vec<String>, std::collections::HashSet<u32>), RouterError> {
        if let Some(cache) = &self.cache {
            if let Some(set) = cache.get_fresh(host) {
                return Ok((set.label.clone(), set.upstreams.clone(), set.dead.clone()));
            }
            let listing = self.store.list_backends(host).await?;
            let set = cache.put(host, listing);
            return Ok((set.label.clone(), set.upstreams.clone(), set.dead.clone()));
        }

        let BackendListing {
            label,
            upstreams,
            dead,
        } = self.store.list_backends(host).await?;
        Ok((label, upstreams, dead))
    }

    async fn counter_for(&self, host: &str) -> Arc<AtomicU32> {
        if let Some(counter) = self.counters.read().await.get(host) {
            return Arc::clone(counter);
        }

        let mut guard = self.counters.write().await;
        // Double-check: another writer may have created it while we waited
        // for the write lock.
        if let Some(counter) = guard.get(host) {
            return Arc::clone(counter);
        }
        let counter = Arc::new(AtomicU32::new(0));
        guard.insert(host.to_string(), Arc::clone(&counter));
        counter
    }

    pub async fn choose(&self, host: &str) -> Result<RequestDecision, RouterError> {
        let start_time = Instant::now();

        let (host_used, label, upstreams, dead) = match self.fetch(host).await {
            Ok((label, upstreams, dead)) => (host.to_string(), label, upstreams, dead),
            Err(RouterError::StoreTransport(crate::store::StoreError::NoBackends)) => {
                match strip_port(host) {
                    Some(stripped) => {
                        let (label, upstreams, dead) = self.fetch(stripped).await.map_err(|e| match e {
                            RouterError::StoreTransport(crate::store::StoreError::NoBackends) => {
                                RouterError::NoRegisteredBackends
                            }
                            other => other,
                        })?;
                        (stripped.to_string(), label, upstreams, dead)
                    }
                    None => return Err(RouterError::NoRegisteredBackends),
                }
            }
            Err(e) => return Err(e),
        };

        let backend_list_len = upstreams.len();
        let counter = self.counter_for(&host_used).await;
        let pre = counter.fetch_add(1, Ordering::Relaxed);
        let start = (pre as usize) % backend_list_len;

        for offset in 0..backend_list_len {
            let position = (start + offset) % backend_list_len;
            if !dead.contains(&(position as u32)) {
                return Ok(RequestDecision {
                    host_used,
                    backend_key: label,
                    backend_list_len,
                    chosen_index: Some(position as u32),
                    chosen_url: Some(upstreams[position].clone()),
                    start_time,
                    all_dead: false,
                });
            }
        }

        let decision = RequestDecision {
            host_used,
            backend_key: label,
            backend_list_len,
            chosen_index: None,
            chosen_url: None,
            start_time,
            all_dead: true,
        };
        Err(RouterError::AllBackendsDead(Box::new(decision)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FakeStore;

    async fn selector_with(upstreams: Vec<&str>) -> (Selector, Arc<FakeStore>) {
        let store = Arc::new(FakeStore::new());
        store
            .set_frontend(
                "example.com",
                "example",
                upstreams.into_iter().map(String::from).collect(),
            )
            .await;
        let selector = Selector::new(store.clone(), false);
        (selector, store)
    }

    #[tokio::test]
    async fn round_robins_evenly_over_live_backends() {
        let (selector, _store) = selector_with(vec!["http://a", "http://b", "http://c"]).await;
        let mut counts = HashMap::new();
        for _ in 0..30 {
            let decision = selector.choose("example.com").await.unwrap();
            *counts.entry(decision.chosen_url.unwrap()).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 3);
        for (_, count) in counts {
            assert_eq!(count, 10);
        }
    }

    #[tokio::test]
    async fn strips_port_on_no_backends_retry() {
        let store = Arc::new(FakeStore::new());
        store
            .set_frontend("example.com", "example", vec!["http://a".to_string()])
            .await;
        let selector = Selector::new(store, false);
        let decision = selector.choose("example.com:8080").await.unwrap();
        assert_eq!(decision.host_used, "example.com");
    }

    #[tokio::test]
    async fn no_registered_backends_when_host_unknown() {
        let store = Arc::new(FakeStore::new());
        let selector = Selector::new(store, false);
        let err = selector.choose("unknown.example").await.unwrap_err();
        assert!(matches!(err, RouterError::NoRegisteredBackends));
    }

    #[tokio::test]
    async fn all_dead_carries_decision_for_logging() {
        let store = Arc::new(FakeStore::new());
        store
            .set_frontend("example.com", "example", vec!["http://a".to_string()])
            .await;
        store
            .mark_dead("example.com", "http://a", 0, 1, std::time::Duration::from_secs(30))
            .await
            .unwrap();
        let selector = Selector::new(store, false);
        match selector.choose("example.com").await {
            Err(RouterError::AllBackendsDead(decision)) => {
                assert_eq!(decision.backend_key, "example");
                assert_eq!(decision.backend_list_len, 1);
            }
            other => panic!("expected AllBackendsDead, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn counter_wraps_without_breaking_balance() {
        let (selector, _store) = selector_with(vec!["http://a", "http://b"]).await;
        let counter = selector.counter_for("example.com").await;
        counter.store(u32::MAX - 1, Ordering::Relaxed);

        let mut counts = HashMap::new();
        for _ in 0..20 {
            let decision = selector.choose("example.com").await.unwrap();
            *counts.entry(decision.chosen_url.unwrap()).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 2);
        let values: Vec<i64> = counts.values().map(|v: &i32| *v as i64).collect();
        assert!((values[0] - values[1]).abs() <= 1);
    }
}
