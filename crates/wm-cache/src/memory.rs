//! In-process cache implementation.
//!
//! [`MemoryCache`] keeps every region in a shared map so that handles opened
//! with the same name see the same entries. Each region is an LRU bounded by a
//! maximum entry count: reads refresh recency, and once full, expired entries
//! are purged first and then the least recently used entry is evicted.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::{CacheProvider, CacheRegion};

/// Default entry bound for regions without an explicit limit.
const DEFAULT_MAX_SIZE: usize = 1000;

/// In-memory [`CacheProvider`] with TTL expiry and size-bounded regions.
#[derive(Clone, Default)]
pub struct MemoryCache {
    regions: Arc<Mutex<HashMap<String, Arc<Mutex<LruCache<String, Entry>>>>>>,
    limits: HashMap<String, NonZeroUsize>,
}

impl MemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the named region to `max_size` entries.
    ///
    /// Applies to regions opened after this call.
    #[must_use]
    pub fn with_max_size(mut self, region: impl Into<String>, max_size: usize) -> Self {
        self.limits.insert(region.into(), non_zero(max_size));
        self
    }

    fn store(&self, name: &str) -> Arc<Mutex<LruCache<String, Entry>>> {
        let mut regions = lock(&self.regions);
        let capacity = self
            .limits
            .get(name)
            .copied()
            .unwrap_or_else(|| non_zero(DEFAULT_MAX_SIZE));
        Arc::clone(
            regions
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(LruCache::new(capacity)))),
        )
    }
}

impl CacheProvider for MemoryCache {
    fn region(&self, name: &str) -> Box<dyn CacheRegion> {
        Box::new(MemoryRegion {
            name: name.to_owned(),
            store: self.store(name),
        })
    }
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Drop every expired entry, returning how many were removed.
fn purge_expired(store: &mut LruCache<String, Entry>, now: Instant) -> usize {
    let expired: Vec<String> = store
        .iter()
        .filter(|(_, entry)| entry.expires_at <= now)
        .map(|(key, _)| key.clone())
        .collect();
    for key in &expired {
        store.pop(key);
    }
    expired.len()
}

/// Handle over one region of a [`MemoryCache`].
struct MemoryRegion {
    name: String,
    store: Arc<Mutex<LruCache<String, Entry>>>,
}

impl CacheRegion for MemoryRegion {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut store = lock(&self.store);
        let now = Instant::now();
        match store.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                store.pop(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) {
        let mut store = lock(&self.store);
        let now = Instant::now();

        if !store.contains(key) && store.len() >= store.cap().get() {
            let mut evicted = purge_expired(&mut store, now);
            if store.len() >= store.cap().get() && store.pop_lru().is_some() {
                evicted += 1;
            }
            tracing::debug!(region = %self.name, evicted, "evicted cache entries");
        }

        store.put(
            key.to_owned(),
            Entry {
                value: value.to_vec(),
                expires_at: now + ttl,
            },
        );
    }
}

/// Capacity clamped to at least one entry.
fn non_zero(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
