//! Runtime settings
//!
//! Everything here is passed in explicitly. Environment variables are only
//! consulted by the CLI layer, which turns them into arguments before calling
//! [`Settings::resolve`].

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::cache::CacheStore;
use crate::version::{DEFAULT_FETCH_TIMEOUT, DEFAULT_REGISTRY_URL};

/// Errors that can occur while resolving settings
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No cache directory was given and none could be derived from the home directory
    #[error("no cache directory available; pass --cache-dir or set MODVER_CACHE_DIR")]
    NoCacheDir,
}

/// Settings shared by every command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Root directory for cache files
    pub cache_dir: PathBuf,
    /// Registry queried for published versions
    pub registry_url: String,
    /// Budget for a single registry request
    pub fetch_timeout: Duration,
}

impl Settings {
    /// Resolves settings, preferring `cache_dir_override` over the XDG cache directory
    pub fn resolve(cache_dir_override: Option<PathBuf>) -> Result<Self, ConfigError> {
        let cache_dir = match cache_dir_override {
            Some(dir) => dir,
            None => CacheStore::new()
                .ok_or(ConfigError::NoCacheDir)?
                .dir()
                .to_path_buf(),
        };
        Ok(Self {
            cache_dir,
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        })
    }

    /// Replaces the registry URL
    pub fn with_registry_url(mut self, url: impl Into<String>) -> Self {
        self.registry_url = url.into();
        self
    }

    /// Replaces the per-request fetch timeout
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Cache store rooted at the configured directory
    pub fn store(&self) -> CacheStore {
        CacheStore::with_dir(self.cache_dir.clone())
    }
}
