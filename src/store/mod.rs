//! Shared-store façade: the boundary between the routing core and whatever
//! backs upstream membership, health state and TLS material (Redis in
//! production, an in-memory double in tests).

pub mod fake_store;
pub mod redis_store;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashSet;
use std::time::Duration;

pub use fake_store::FakeStore;
pub use redis_store::RedisStore;

/// Default lifetime of a probing lease, and of its refresh cadence.
pub const PROBE_LEASE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no backends registered for host")]
    NoBackends,
    #[error("backend is not in the upstream list")]
    BackendNotInList,
    #[error("store transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

/// The ordered upstream list plus the positions currently marked dead,
/// fetched as one atomic snapshot.
#[derive(Debug, Clone)]
pub struct BackendListing {
    pub label: String,
    pub upstreams: Vec<String>,
    pub dead: HashSet<u32>,
}

/// Per-host health-check descriptor. Any field may be "unspecified".
#[derive(Debug, Clone, Default)]
pub struct HealthSpec {
    pub path: String,
    pub expected_body_substring: String,
    pub expected_status: u16,
}

/// Per-host TLS material sourced from the store.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub certificate_pem: String,
    pub key_pem: String,
}

/// A dead-backend gossip notice broadcast on the `dead` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadNotice {
    pub host: String,
    pub upstream_url: String,
    pub position: u32,
    pub list_len: u32,
}

impl DeadNotice {
    /// Parses the wire payload `"<host>;<upstream_url>;<position>;<list_len>"`.
    /// Malformed payloads return `None` and are silently skipped by callers.
    pub fn parse(payload: &str) -> Option<Self> {
        let mut parts = payload.splitn(4, ';');
        let host = parts.next()?.to_string();
        let upstream_url = parts.next()?.to_string();
        let position: u32 = parts.next()?.parse().ok()?;
        let list_len: u32 = parts.next()?.parse().ok()?;
        Some(Self {
            host,
            upstream_url,
            position,
            list_len,
        })
    }

    pub fn render(&self) -> String {
        format!(
            "{};{};{};{}",
            self.host, self.upstream_url, self.position, self.list_len
        )
    }
}

/// Abstract operations the routing core needs from the shared store.
#[async_trait]
pub trait StoreFacade: Send + Sync {
    /// Cheap round-trip used by the `__ping__` endpoint.
    async fn healthcheck(&self) -> Result<(), StoreError>;

    /// Atomic read of a host's upstream list and dead set.
    async fn list_backends(&self, host: &str) -> Result<BackendListing, StoreError>;

    /// Marks `position` dead for `host`, resets the dead-set TTL, and
    /// broadcasts a [`DeadNotice`] on the dead channel.
    async fn mark_dead(
        &self,
        host: &str,
        upstream_url: &str,
        position: u32,
        list_len: u32,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Subscribes to the dead-notice stream. Malformed payloads are skipped.
    async fn subscribe(&self) -> Result<BoxStream<'static, DeadNotice>, StoreError>;

    /// Compare-and-set lease acquisition/refresh.
    async fn acquire_lease(
        &self,
        host: &str,
        upstream_url: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Best-effort lease release.
    async fn release_lease(&self, host: &str, upstream_url: &str) -> Result<(), StoreError>;

    /// Clears the dead marker for `upstream_url`, re-resolving its position
    /// transactionally against the current list.
    async fn clear_dead(&self, host: &str, upstream_url: &str) -> Result<(), StoreError>;

    /// Re-asserts the dead marker for `upstream_url` (probe still failing).
    async fn re_add_dead(&self, host: &str, upstream_url: &str) -> Result<(), StoreError>;

    /// Reads the health-check descriptor for `host`.
    async fn read_health_spec(&self, host: &str) -> Result<HealthSpec, StoreError>;

    /// Reads TLS material for `host`, if any has been configured.
    async fn read_tls_material(&self, host: &str) -> Result<Option<TlsMaterial>, StoreError>;
}
