//! Optional per-host memo of upstream sets, absorbing bursts of lookups
//! within a short window at the cost of up to `CACHE_TTL` staleness.

use crate::store::BackendListing;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared with the TLS cert cache: both are "trust the store, refresh
/// periodically" caches of store-sourced data.
pub const CACHE_TTL: Duration = Duration::from_secs(2);

const MAX_ENTRIES: usize = 100;

#[derive(Debug)]
pub struct BackendSet {
    pub label: String,
    pub upstreams: Vec<String>,
    pub dead: HashSet<u32>,
    pub fetched_at: Instant,
}

impl BackendSet {
    fn from_listing(listing: BackendListing) -> Self {
        Self {
            label: listing.label,
            upstreams: listing.upstreams,
            dead: listing.dead,
            fetched_at: Instant::now(),
        }
    }

    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < CACHE_TTL
    }
}

/// A bounded LRU of `(HostLabel, UpstreamList, DeadSet, fetched_at)` tuples.
/// Entries are never mutated in place: a refresh inserts a brand-new
/// `Arc<BackendSet>`, so readers always see an immutable, consistent snapshot.
pub struct BackendSetCache {
    inner: Mutex<LruCache<String, Arc<BackendSet>>>,
}

impl BackendSetCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::new(NonZeroUsize::new(MAX_ENTRIES).unwrap())),
        }
    }

    /// Returns a fresh cached entry for `host`, if present and not expired.
    pub fn get_fresh(&self, host: &str) -> Option<Arc<BackendSet>> {
        let mut guard = self.inner.lock();
        let set = guard.get(host)?;
        if set.is_fresh() {
            Some(Arc::clone(set))
        } else {
            None
        }
    }

    pub fn put(&self, host: &str, listing: BackendListing) -> Arc<BackendSet> {
        let set = Arc::new(BackendSet::from_listing(listing));
        self.inner.lock().put(host.to_string(), Arc::clone(&set));
        set
    }
}

impl Default for BackendSetCache {
    fn default() -> Self {
        Self::new()
    }
}
