//! In-memory double of [`super::StoreFacade`] for tests and the local harness.

use super::{BackendListing, DeadNotice, HealthSpec, StoreError, StoreFacade, TlsMaterial};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;

struct Lease {
    holder: String,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    frontends: HashMap<String, (String, Vec<String>)>,
    dead: HashMap<String, HashSet<u32>>,
    leases: HashMap<(String, String), Lease>,
    health_specs: HashMap<String, HealthSpec>,
    tls: HashMap<String, TlsMaterial>,
}

pub struct FakeStore {
    state: Mutex<State>,
    dead_tx: broadcast::Sender<DeadNotice>,
    healthy: std::sync::atomic::AtomicBool,
}

impl FakeStore {
    pub fn new() -> Self {
        let (dead_tx, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(State::default()),
            dead_tx,
            healthy: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Test helper: registers a host with a label and ordered upstream list.
    pub async fn set_frontend(&self, host: &str, label: &str, upstreams: Vec<String>) {
        let mut state = self.state.lock().await;
        state
            .frontends
            .insert(host.to_string(), (label.to_string(), upstreams));
    }

    pub async fn set_health_spec(&self, host: &str, spec: HealthSpec) {
        let mut state = self.state.lock().await;
        state.health_specs.insert(host.to_string(), spec);
    }

    pub async fn set_tls(&self, host: &str, material: TlsMaterial) {
        let mut state = self.state.lock().await;
        state.tls.insert(host.to_string(), material);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, std::sync::atomic::Ordering::Relaxed);
    }

    pub async fn dead_positions(&self, host: &str) -> HashSet<u32> {
        self.state
            .lock()
            .await
            .dead
            .get(host)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for FakeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreFacade for FakeStore {
    async fn healthcheck(&self) -> Result<(), StoreError> {
        if self.healthy.load(std::sync::atomic::Ordering::Relaxed) {
            Ok(())
        } else {
            Err(StoreError::Transport(anyhow::anyhow!("store marked unhealthy")))
        }
    }

    async fn list_backends(&self, host: &str) -> Result<BackendListing, StoreError> {
        let state = self.state.lock().await;
        let (label, upstreams) = state.frontends.get(host).ok_or(StoreError::NoBackends)?;
        if upstreams.is_empty() {
            return Err(StoreError::NoBackends);
        }
        let dead = state.dead.get(host).cloned().unwrap_or_default();
        Ok(BackendListing {
            label: label.clone(),
            upstreams: upstreams.clone(),
            dead,
        })
    }

    async fn mark_dead(
        &self,
        host: &str,
        upstream_url: &str,
        position: u32,
        list_len: u32,
        _ttl: Duration,
    ) -> Result<(), StoreError> {
        {
            let mut state = self.state.lock().await;
            state.dead.entry(host.to_string()).or_default().insert(position);
        }
        let _ = self.dead_tx.send(DeadNotice {
            host: host.to_string(),
            upstream_url: upstream_url.to_string(),
            position,
            list_len,
        });
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, DeadNotice>, StoreError> {
        let rx = self.dead_tx.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|item| async move { item.ok() });
        Ok(stream.boxed())
    }

    async fn acquire_lease(
        &self,
        host: &str,
        upstream_url: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let key = (host.to_string(), upstream_url.to_string());
        let now = Instant::now();

        if let Some(existing) = state.leases.get(&key) {
            if existing.expires_at > now && existing.holder != holder_id {
                return Ok(false);
            }
        }

        state.leases.insert(
            key,
            Lease {
                holder: holder_id.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, host: &str, upstream_url: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .leases
            .remove(&(host.to_string(), upstream_url.to_string()));
        Ok(())
    }

    async fn clear_dead(&self, host: &str, upstream_url: &str) -> Result<(), StoreError> {
        self.mutate_dead_for_url(host, upstream_url, false).await
    }

    async fn re_add_dead(&self, host: &str, upstream_url: &str) -> Result<(), StoreError> {
        self.mutate_dead_for_url(host, upstream_url, true).await
    }

    async fn read_health_spec(&self, host: &str) -> Result<HealthSpec, StoreError> {
        let state = self.state.lock().await;
        Ok(state.health_specs.get(host).cloned().unwrap_or_default())
    }

    async fn read_tls_material(&self, host: &str) -> Result<Option<TlsMaterial>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tls.get(host).cloned())
    }
}

impl FakeStore {
    async fn mutate_dead_for_url(
        &self,
        host: &str,
        upstream_url: &str,
        mark_dead: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let (_, upstreams) = state
            .frontends
            .get(host)
            .ok_or(StoreError::BackendNotInList)?
            .clone();

        let position = upstreams
            .iter()
            .position(|u| u == upstream_url)
            .ok_or(StoreError::BackendNotInList)? as u32;

        let entry = state.dead.entry(host.to_string()).or_default();
        if mark_dead {
            entry.insert(position);
        } else {
            entry.remove(&position);
        }
        Ok(())
    }
}
