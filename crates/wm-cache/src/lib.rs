//! Cache region abstraction for the wm markup pipeline.
//!
//! Consumers never talk to a storage backend directly. Two traits form the
//! core API:
//!
//! - [`CacheProvider`]: Factory for named cache regions
//! - [`CacheRegion`]: Key-value store whose entries expire after a TTL
//!
//! Eviction policy belongs to the provider; callers only choose the TTL per
//! write.
//!
//! # Implementations
//!
//! - [`NullCache`] / [`NullCacheRegion`]: No-op implementations (always miss)
//! - [`MemoryCache`]: In-process map with TTL and a per-region size bound
//! - [`FileCache`]: One directory per region with an expiry header per entry
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use wm_cache::{CacheProvider, NullCache};
//!
//! let cache = NullCache;
//! let region = cache.region("parse_results");
//! region.set("parse:abc", b"<p>hello</p>", Duration::from_secs(300));
//! assert_eq!(region.get("parse:abc"), None); // NullCache always misses
//! ```

mod ext;
mod file;
mod memory;

use std::time::Duration;

pub use ext::CacheRegionExt;
pub use file::FileCache;
pub use memory::MemoryCache;

/// A named, independently configured partition within a [`CacheProvider`].
///
/// Writes are last-write-wins. Values stored under the same key by concurrent
/// writers are expected to be equivalent, so no locking is exposed to callers.
pub trait CacheRegion: Send + Sync {
    /// Retrieve a cached value.
    ///
    /// Returns `None` on miss or when the stored entry has expired.
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Store a value that expires after `ttl`.
    ///
    /// Overwrites any existing entry for the same key.
    fn set(&self, key: &str, value: &[u8], ttl: Duration);
}

/// Factory for named [`CacheRegion`]s.
///
/// Regions with different names never observe each other's keys. Opening the
/// same name twice may return independent handles over shared storage.
pub trait CacheProvider: Send + Sync {
    /// Open or create a named region.
    ///
    /// # Arguments
    ///
    /// * `name` - Region name (e.g., "`parse_results`", "variables")
    fn region(&self, name: &str) -> Box<dyn CacheRegion>;
}

/// No-op [`CacheRegion`] that never stores or retrieves data.
pub struct NullCacheRegion;

impl CacheRegion for NullCacheRegion {
    fn get(&self, _key: &str) -> Option<Vec<u8>> {
        None
    }

    fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) {}
}

/// No-op [`CacheProvider`] that always returns [`NullCacheRegion`]s.
///
/// Use when caching is disabled.
pub struct NullCache;

impl CacheProvider for NullCache {
    fn region(&self, _name: &str) -> Box<dyn CacheRegion> {
        Box::new(NullCacheRegion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_cache_always_misses() {
        let cache = NullCache;
        let region = cache.region("parse_results");

        assert_eq!(region.get("key"), None);

        region.set("key", b"hello", Duration::from_secs(60));
        assert_eq!(region.get("key"), None);
    }

    #[test]
    fn test_null_cache_different_regions_all_miss() {
        let cache = NullCache;

        for name in &["parse_results", "handler_results", "patterns", "variables"] {
            let region = cache.region(name);
            region.set("k", b"data", Duration::from_secs(60));
            assert_eq!(region.get("k"), None, "region {name} should miss");
        }
    }
}
