//! Disk-backed TTL cache
//!
//! `CacheStore` persists one JSON document per key and judges freshness from the
//! file's modification time. `Cacher` wraps an async producer around a store
//! entry, recomputing it when stale and letting concurrent callers share one
//! recomputation.

mod cacher;
mod error;
mod store;

pub use cacher::{Cacher, Producer};
pub use error::{BoxError, CacheError};
pub use store::{CacheStore, CachedData};
