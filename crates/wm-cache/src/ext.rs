//! Extension trait for [`CacheRegion`] with typed convenience methods.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::CacheRegion;

/// Typed convenience methods for [`CacheRegion`].
///
/// Keeps [`CacheRegion`] object-safe and byte-oriented while giving callers
/// `get_json`/`set_json` for serde types and `get_string`/`set_string` for
/// rendered HTML.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use wm_cache::{CacheProvider, CacheRegionExt, NullCache};
///
/// let cache = NullCache;
/// let region = cache.region("patterns");
///
/// region.set_json("elements", &vec!["a", "b"], Duration::from_secs(60));
/// let data: Option<Vec<String>> = region.get_json("elements");
/// assert!(data.is_none());
/// ```
pub trait CacheRegionExt: CacheRegion {
    /// Retrieve a JSON-deserialized value.
    ///
    /// Returns `None` on miss, expiry, or deserialization failure.
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(key, error = %e, "discarding undecodable cache entry");
                None
            }
        }
    }

    /// Store a value as JSON.
    ///
    /// Silently does nothing if serialization fails.
    fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        if let Ok(bytes) = serde_json::to_vec(value) {
            self.set(key, &bytes, ttl);
        }
    }

    /// Retrieve a cached UTF-8 string.
    fn get_string(&self, key: &str) -> Option<String> {
        let bytes = self.get(key)?;
        String::from_utf8(bytes).ok()
    }

    /// Store a string value.
    fn set_string(&self, key: &str, value: &str, ttl: Duration) {
        self.set(key, value.as_bytes(), ttl);
    }
}

impl<R: CacheRegion + ?Sized> CacheRegionExt for R {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CacheProvider, MemoryCache};

    #[test]
    fn test_string_round_trip_through_memory_region() {
        let cache = MemoryCache::new();
        let region = cache.region("parse_results");

        region.set_string("page", "<p>hi</p>", Duration::from_secs(60));
        assert_eq!(region.get_string("page").as_deref(), Some("<p>hi</p>"));
    }

    #[test]
    fn test_get_json_ignores_garbage() {
        let cache = MemoryCache::new();
        let region = cache.region("patterns");

        region.set("bad", b"{not json", Duration::from_secs(60));
        let value: Option<Vec<u32>> = region.get_json("bad");
        assert!(value.is_none());
    }
}
