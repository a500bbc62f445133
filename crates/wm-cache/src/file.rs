//! File-based cache implementation.
//!
//! [`FileCache`] stores entries as files on disk, one subdirectory per region.
//! Each entry is a single file with a fixed header followed by the data:
//!
//! ```text
//! [expires_at: u64 LE, seconds since UNIX epoch][data bytes]
//! ```
//!
//! On read, only the header is read first. The data is read only when the
//! entry is still live; expired entries are removed on access.
//!
//! On construction, [`FileCache`] validates a `VERSION` file in the cache root.
//! If the version mismatches or is missing, the whole cache directory is wiped
//! and recreated, so entries written by an incompatible build are never read.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{CacheProvider, CacheRegion};

/// File-based [`CacheProvider`] rooted at a directory on disk.
///
/// Directory layout:
/// ```text
/// {root}/
/// +-- VERSION              # contains the cache version string
/// +-- parse_results/       # region "parse_results"
/// |   +-- parse_3fa2..     # cache entry
/// +-- variables/
///     +-- ...
/// ```
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    /// Create a file-based cache at `root`, validating the cache version.
    ///
    /// Errors during validation are logged but never fatal.
    #[must_use]
    pub fn new(root: PathBuf, version: &str) -> Self {
        validate_version(&root, version);
        Self { root }
    }
}

impl CacheProvider for FileCache {
    fn region(&self, name: &str) -> Box<dyn CacheRegion> {
        Box::new(FileCacheRegion {
            dir: self.root.join(name),
        })
    }
}

/// A single region backed by a directory on disk.
struct FileCacheRegion {
    dir: PathBuf,
}

impl FileCacheRegion {
    fn entry_path(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(file_name.trim_start_matches('/'))
    }
}

impl CacheRegion for FileCacheRegion {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.entry_path(key);
        let mut file = File::open(&path).ok()?;

        let mut header = [0u8; 8];
        file.read_exact(&mut header).ok()?;
        let expires_at = u64::from_le_bytes(header);

        if expires_at <= unix_now() {
            drop(file);
            let _ = fs::remove_file(&path);
            return None;
        }

        let mut data = Vec::new();
        file.read_to_end(&mut data).ok()?;
        Some(data)
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) {
        let path = self.entry_path(key);

        // Cache writes are best effort
        let Some(parent) = path.parent() else {
            return;
        };
        if fs::create_dir_all(parent).is_err() {
            return;
        }

        let expires_at = unix_now().saturating_add(ttl.as_secs());
        let mut buf = Vec::with_capacity(8 + value.len());
        buf.extend_from_slice(&expires_at.to_le_bytes());
        buf.extend_from_slice(value);

        if let Err(e) = fs::write(&path, &buf) {
            tracing::debug!(path = %path.display(), error = %e, "failed to write cache entry");
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Validate the cache version, wiping the directory on mismatch.
fn validate_version(root: &Path, version: &str) {
    let version_file = root.join("VERSION");

    match fs::read_to_string(&version_file) {
        Ok(stored) if stored == version => {
            tracing::debug!("cache version matches: {version}");
            return;
        }
        Ok(stored) => {
            tracing::info!(
                "cache version mismatch (stored={stored}, current={version}), wiping cache"
            );
        }
        Err(_) => {
            tracing::info!("no cache VERSION file found, initializing cache");
        }
    }

    if root.exists()
        && let Err(e) = fs::remove_dir_all(root)
    {
        tracing::warn!("failed to remove cache directory: {e}");
    }
    if let Err(e) = fs::create_dir_all(root) {
        tracing::warn!("failed to create cache directory: {e}");
        return;
    }
    if let Err(e) = fs::write(&version_file, version) {
        tracing::warn!("failed to write cache VERSION file: {e}");
    }
}
