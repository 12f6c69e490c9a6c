//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};

/// Trait for values that identify a cached resource.
///
/// The rendered key must be stable: the same logical resource and filter
/// parameters always produce the same string.
pub trait QueryKey {
  /// Key used for store and in-flight lookups (e.g. "listings:status=open")
  fn cache_key(&self) -> String;

  /// Human readable description for logs
  fn description(&self) -> String {
    self.cache_key()
  }
}

impl QueryKey for str {
  fn cache_key(&self) -> String {
    self.to_string()
  }
}

impl QueryKey for String {
  fn cache_key(&self) -> String {
    self.clone()
  }
}

impl<K: QueryKey + ?Sized> QueryKey for &K {
  fn cache_key(&self) -> String {
    (**self).cache_key()
  }

  fn description(&self) -> String {
    (**self).description()
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Data produced by a fetch this caller started.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Data produced by a fetch another caller had already started.
  pub fn joined(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Joined,
      cached_at: None,
    }
  }

  /// Fresh data served from the store.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh entry in the store
  Cache,
  /// A fetch started by this caller
  Network,
  /// An in-flight fetch started by someone else
  Joined,
}
