//! Disk store for cached values
//!
//! Provides a `CacheStore` that keeps one JSON document per key. Freshness comes
//! from the file's modification time, so the document itself is exactly what the
//! producer returned.

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, trace};

use super::CacheError;

/// Distinguishes temp files written concurrently by the same process
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Result of reading from the store, including metadata about cache freshness
#[derive(Debug)]
pub struct CachedData<T> {
    /// The cached data
    pub data: T,
    /// When the data was written, taken from the file's modification time
    pub cached_at: DateTime<Utc>,
    /// Whether the entry is older than the TTL it was read with
    pub is_expired: bool,
}

/// Reads and writes cached values as JSON files under one root directory
///
/// The default root is the XDG cache directory (`~/.cache/modver/` on Linux).
/// Expired entries are still returned (with `is_expired = true`) so callers can
/// decide between recomputing and degrading gracefully.
#[derive(Debug, Clone)]
pub struct CacheStore {
    /// Directory where cache files are stored
    cache_dir: PathBuf,
}

impl CacheStore {
    /// Creates a store in the XDG-compliant cache directory
    ///
    /// Returns `None` if the cache directory cannot be determined (e.g., no home directory).
    pub fn new() -> Option<Self> {
        let project_dirs = ProjectDirs::from("", "", "modver")?;
        let cache_dir = project_dirs.cache_dir().to_path_buf();
        Some(Self { cache_dir })
    }

    /// Creates a store rooted at a custom directory
    pub fn with_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Root directory of this store
    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns the path of the cache file for `key`
    ///
    /// Characters outside `[A-Za-z0-9._-]` are replaced with `_`, so keys such as
    /// `@scope/pkg-updates` stay inside the root.
    pub fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.json", sanitize_key(key)))
    }

    /// Reads the entry for `key`, judging freshness against `ttl`
    ///
    /// Returns `None` if the file is missing, unreadable or does not parse as `T`.
    /// A corrupt entry is indistinguishable from a missing one.
    pub async fn read<T: DeserializeOwned>(&self, key: &str, ttl: Duration) -> Option<CachedData<T>> {
        let path = self.cache_path(key);
        let modified = fs::metadata(&path).await.ok()?.modified().ok()?;
        let content = fs::read_to_string(&path).await.ok()?;
        let data: T = match serde_json::from_str(&content) {
            Ok(data) => data,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "ignoring unparsable cache file");
                return None;
            }
        };

        // An mtime in the future (clock skew) counts as brand new.
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);

        Some(CachedData {
            data,
            cached_at: DateTime::<Utc>::from(modified),
            is_expired: age >= ttl,
        })
    }

    /// Writes `data` as the entry for `key`, replacing any previous entry
    ///
    /// The JSON is written to a temp file next to the target and renamed into
    /// place, so concurrent readers see either the old or the new document.
    pub async fn write<T: Serialize>(&self, key: &str, data: &T) -> Result<(), CacheError> {
        let path = self.cache_path(key);
        let json = serde_json::to_string_pretty(data)
            .map_err(|e| CacheError::Serialize(Arc::new(e)))?;

        let write_failed = |source: std::io::Error| CacheError::CacheWriteFailed {
            path: path.clone(),
            source: Arc::new(source),
        };

        fs::create_dir_all(&self.cache_dir).await.map_err(write_failed)?;

        let tmp = self.temp_path(&path);
        if let Err(err) = fs::write(&tmp, json).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(write_failed(err));
        }
        if let Err(err) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(write_failed(err));
        }

        trace!(path = %path.display(), "cache entry written");
        Ok(())
    }

    fn temp_path(&self, target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.cache_dir
            .join(format!(".{}.{}.{}.tmp", name, process::id(), n))
    }
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
