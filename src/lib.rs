//! In-memory result cache and request coordination for async data fetching.
//!
//! A [`Cache`] combines a TTL store with an in-flight registry so that
//! concurrent requests for the same key share one fetch. [`CacheBinding`]
//! wraps a single key for a long-lived consumer, [`PagedBinding`] accumulates
//! pages under one key for infinite scrolling, and [`rate`] holds the
//! debounce and throttle helpers used in front of high-churn inputs.

pub mod binding;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod logging;
pub mod paged;
pub mod rate;

pub use binding::{BindingSnapshot, BindingStatus, CacheBinding};
pub use cache::{
  Cache, CacheKey, CacheResult, CacheSource, CacheStats, CacheStore, FetchPolicy, InFlightRegistry,
  KeyMatcher, PageChunk, PageRequest, PagedEntry, QueryKey,
};
pub use cancel::CancelToken;
pub use config::Config;
pub use error::{LoadError, LoadResult};
pub use paged::PagedBinding;
pub use rate::{Debouncer, Throttle};
