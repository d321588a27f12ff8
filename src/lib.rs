//! modver library
//!
//! A disk-backed TTL cache with de-duplicated recomputation, an arrival-order
//! stream merger, and the module update checker and event bus built on them.

pub mod cache;
pub mod cli;
pub mod config;
pub mod events;
pub mod merge;
pub mod version;

pub use cache::{CacheError, CacheStore, Cacher, Producer};
pub use merge::{merge_async, merge_try_async, MergeError, MergedStream};
pub use version::{compare_versions, ModuleVersionChecker, UpdateStatus};
