//! Error type shared by the cache store and `Cacher`

use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Boxed error returned by producers
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Errors that can occur while computing or persisting a cached value
///
/// Cloneable so that one failed recomputation can be handed to every caller
/// that joined it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The wrapped producer failed
    #[error("producer failed: {0}")]
    ProducerFailed(#[source] Arc<dyn StdError + Send + Sync>),

    /// The cache file could not be written
    #[error("failed to write cache file {}: {source}", .path.display())]
    CacheWriteFailed {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    /// The produced value could not be serialized to JSON
    #[error("failed to serialize cache value: {0}")]
    Serialize(#[source] Arc<serde_json::Error>),

    /// The caller's time budget ran out before a value was available
    #[error("timed out after {0:?} waiting for cached value")]
    Timeout(Duration),
}

impl CacheError {
    pub(crate) fn producer(err: BoxError) -> Self {
        CacheError::ProducerFailed(Arc::from(err))
    }
}
