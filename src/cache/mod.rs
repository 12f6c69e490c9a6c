//! Generic in-memory result cache with request coordination.
//!
//! This module provides a domain-agnostic caching mechanism that:
//! - Stores arbitrary values under string keys with a per-entry TTL
//! - Runs at most one fetch per key at a time, sharing its outcome with every caller
//! - Cancels a fetch once no caller is interested in it anymore
//! - Serves stale data when a refresh fails
//! - Invalidates single keys, everything, or keys matching a pattern

mod inflight;
mod key;
mod layer;
mod paged;
mod store;
mod traits;

pub use inflight::{FetchOutcome, Flight, FlightContext, FlightFuture, InFlightRegistry, Interest};
pub use key::{CacheKey, KeyMatcher};
pub use layer::{Cache, CacheStats, FetchPolicy};
pub use paged::{PageChunk, PageRequest, PagedEntry};
pub use store::{BatchLookup, CacheStore, CachedValue};
pub use traits::{CacheResult, CacheSource, QueryKey};

pub(crate) use key::namespace_of;
