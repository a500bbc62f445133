//! Named cache regions used by the pipeline.
//!
//! The facade opens one region per [`CacheRegionId`] from the configured
//! provider, applies the region's enable switch and TTL, and counts hits,
//! misses and writes. Writes are last-write-wins: every cached value is a pure
//! function of its key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use wm_cache::{CacheProvider, CacheRegion, CacheRegionExt, MemoryCache};
use wm_config::{CacheRegionId, Config, RegionSettings};

use crate::util::hash_parts;

/// Counters for one cache region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegionStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
}

impl RegionStats {
    /// Hits divided by lookups, `0.0` before the first lookup.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// One configured region with its counters.
pub(crate) struct RegionHandle {
    region: Box<dyn CacheRegion>,
    enabled: bool,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl RegionHandle {
    fn new(region: Box<dyn CacheRegion>, settings: RegionSettings) -> Self {
        Self {
            region,
            enabled: settings.enabled,
            ttl: Duration::from_secs(settings.ttl),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn record<T>(&self, value: Option<T>) -> Option<T> {
        let counter = if value.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    pub(crate) fn get_string(&self, key: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }
        self.record(self.region.get_string(key))
    }

    pub(crate) fn set_string(&self, key: &str, value: &str) {
        self.set_string_with_ttl(key, value, self.ttl);
    }

    pub(crate) fn set_string_with_ttl(&self, key: &str, value: &str, ttl: Duration) {
        if self.enabled {
            self.region.set_string(key, value, ttl);
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.enabled {
            return None;
        }
        self.record(self.region.get_json(key))
    }

    pub(crate) fn set_json<T: Serialize>(&self, key: &str, value: &T) {
        if self.enabled {
            self.region.set_json(key, value, self.ttl);
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn stats(&self) -> RegionStats {
        RegionStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
    }
}

/// The pipeline's four cache regions.
pub(crate) struct CacheFacade {
    regions: [RegionHandle; 4],
}

impl CacheFacade {
    /// Open all regions from `provider` using the cache settings in `config`.
    ///
    /// `parser.caching = false` disables every region. The parse result TTL
    /// falls back to `parser.cache_ttl` when the region sets none.
    pub(crate) fn new(provider: &dyn CacheProvider, config: &Config) -> Self {
        let open = |id: CacheRegionId| {
            let mut settings = config.cache.settings(id);
            if id == CacheRegionId::ParseResults && config.cache.parse_results.ttl.is_none() {
                settings.ttl = config.parser.cache_ttl;
            }
            settings.enabled &= config.parser.caching;
            tracing::debug!(
                region = id.as_str(),
                enabled = settings.enabled,
                ttl = settings.ttl,
                "Opening cache region"
            );
            RegionHandle::new(provider.region(id.as_str()), settings)
        };
        Self {
            regions: CacheRegionId::ALL.map(open),
        }
    }

    pub(crate) fn region(&self, id: CacheRegionId) -> &RegionHandle {
        let index = CacheRegionId::ALL
            .iter()
            .position(|r| *r == id)
            .unwrap_or_default();
        &self.regions[index]
    }

    /// Counters for every region, by region name.
    pub(crate) fn stats(&self) -> Vec<(&'static str, RegionStats)> {
        CacheRegionId::ALL
            .iter()
            .zip(&self.regions)
            .map(|(id, handle)| (id.as_str(), handle.stats()))
            .collect()
    }

    pub(crate) fn reset_stats(&self) {
        for handle in &self.regions {
            handle.reset();
        }
    }
}

/// Cache key for a rendered page.
///
/// Combines a hash of the content with the context hash, which already folds
/// in the coarse time bucket.
pub(crate) fn fingerprint(content: &str, context_hash: &str) -> String {
    format!("parse:{}:{context_hash}", hash_parts(&[content]))
}

/// Build a [`MemoryCache`] sized by the configured `max_size` of each region.
#[must_use]
pub fn memory_cache_for(config: &Config) -> MemoryCache {
    CacheRegionId::ALL
        .iter()
        .fold(MemoryCache::new(), |cache, id| {
            cache.with_max_size(id.as_str(), config.cache.settings(*id).max_size)
        })
}

#[cfg(test)]
mod tests {
    use wm_cache::NullCache;

    use super::*;

    #[test]
    fn test_hits_and_misses_counted() {
        let facade = CacheFacade::new(&MemoryCache::new(), &Config::default());
        let region = facade.region(CacheRegionId::ParseResults);

        assert_eq!(region.get_string("k"), None);
        region.set_string("k", "<p>v</p>");
        assert_eq!(region.get_string("k").as_deref(), Some("<p>v</p>"));

        let stats: Vec<_> = facade.stats();
        assert_eq!(stats[0].0, "parse_results");
        assert_eq!(
            stats[0].1,
            RegionStats {
                hits: 1,
                misses: 1,
                writes: 1
            }
        );
        assert!((stats[0].1.hit_ratio() - 0.5).abs() < f64::EPSILON);

        facade.reset_stats();
        assert_eq!(facade.stats()[0].1, RegionStats::default());
    }

    #[test]
    fn test_disabled_region_skips_provider() {
        let mut config = Config::default();
        config.cache.variables.enabled = Some(false);
        let facade = CacheFacade::new(&MemoryCache::new(), &config);
        let region = facade.region(CacheRegionId::Variables);

        region.set_string("k", "v");
        assert_eq!(region.get_string("k"), None);
        assert_eq!(facade.stats()[3].1, RegionStats::default());
    }

    #[test]
    fn test_caching_switch_disables_all_regions() {
        let mut config = Config::default();
        config.parser.caching = false;
        let facade = CacheFacade::new(&MemoryCache::new(), &config);
        assert!(
            CacheRegionId::ALL
                .iter()
                .all(|id| !facade.region(*id).is_enabled())
        );
    }

    #[test]
    fn test_null_provider_always_misses() {
        let facade = CacheFacade::new(&NullCache, &Config::default());
        let region = facade.region(CacheRegionId::Patterns);
        region.set_json("k", &vec![1, 2, 3]);
        assert_eq!(region.get_json::<Vec<i32>>("k"), None);
    }

    #[test]
    fn test_fingerprint_varies_with_content_and_context() {
        let a = fingerprint("hello", "ctx1");
        assert_eq!(a, fingerprint("hello", "ctx1"));
        assert_ne!(a, fingerprint("hello!", "ctx1"));
        assert_ne!(a, fingerprint("hello", "ctx2"));
        assert!(a.starts_with("parse:"));
    }
}
