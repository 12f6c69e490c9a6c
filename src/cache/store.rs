//! Keyed in-memory store with per-entry freshness.

use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::paged::{PageChunk, PageRequest, PagedEntry};

/// A single stored value with its freshness metadata.
struct CacheEntry {
  value: Arc<dyn Any + Send + Sync>,
  /// Monotonic write time, used for freshness
  stored_at: Instant,
  /// Wall clock write time, reported to callers
  cached_at: DateTime<Utc>,
  ttl: Duration,
}

impl CacheEntry {
  fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
    now.saturating_duration_since(self.stored_at) < ttl
  }
}

/// A fresh value read from the store.
#[derive(Debug, Clone)]
pub struct CachedValue<T> {
  pub value: T,
  pub cached_at: DateTime<Utc>,
}

/// Result of looking up several keys at once.
#[derive(Debug, Clone)]
pub struct BatchLookup<T> {
  /// Fresh values by key
  pub found: HashMap<String, T>,
  /// Keys that were absent, stale or of another type, in request order
  pub missing: Vec<String>,
}

/// Process-wide map of cached values.
///
/// Values are stored type-erased so one store can serve callers of different
/// value types. Freshness is evaluated lazily on read; `sweep` only bounds
/// memory.
pub struct CacheStore {
  entries: Mutex<HashMap<String, CacheEntry>>,
  default_ttl: Duration,
}

impl CacheStore {
  pub fn new(default_ttl: Duration) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      default_ttl,
    }
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Get a fresh value.
  ///
  /// `ttl_override` takes precedence over the TTL the entry was stored with.
  /// Absent, stale and wrongly-typed entries are all a miss.
  pub fn get<T>(&self, key: &str, ttl_override: Option<Duration>) -> Option<T>
  where
    T: Clone + Send + Sync + 'static,
  {
    self.get_entry(key, ttl_override).map(|c| c.value)
  }

  /// Get a fresh value together with the time it was written.
  pub fn get_entry<T>(&self, key: &str, ttl_override: Option<Duration>) -> Option<CachedValue<T>>
  where
    T: Clone + Send + Sync + 'static,
  {
    let entries = self.lock();
    let entry = entries.get(key)?;

    let ttl = ttl_override.unwrap_or(entry.ttl);
    if !entry.is_fresh(Instant::now(), ttl) {
      debug!(key, "cache entry stale");
      return None;
    }

    match entry.value.downcast_ref::<T>() {
      Some(value) => Some(CachedValue {
        value: value.clone(),
        cached_at: entry.cached_at,
      }),
      None => {
        warn!(
          key,
          expected = std::any::type_name::<T>(),
          "cache entry holds a different type"
        );
        None
      }
    }
  }

  /// Look up several keys, splitting them into fresh hits and misses.
  pub fn get_many<T, I, K>(&self, keys: I) -> BatchLookup<T>
  where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = K>,
    K: AsRef<str>,
  {
    let mut found = HashMap::new();
    let mut missing = Vec::new();

    for key in keys {
      let key = key.as_ref();
      match self.get::<T>(key, None) {
        Some(value) => {
          found.insert(key.to_string(), value);
        }
        None => missing.push(key.to_string()),
      }
    }

    debug!(hits = found.len(), misses = missing.len(), "batch lookup");
    BatchLookup { found, missing }
  }

  /// Store a value, replacing any existing entry and resetting its age.
  pub fn set<T>(&self, key: &str, value: T, ttl: Option<Duration>)
  where
    T: Send + Sync + 'static,
  {
    let ttl = ttl.unwrap_or(self.default_ttl);
    self.lock().insert(
      key.to_string(),
      CacheEntry {
        value: Arc::new(value),
        stored_at: Instant::now(),
        cached_at: Utc::now(),
        ttl,
      },
    );
    debug!(key, ttl_ms = ttl.as_millis() as u64, "cache set");
  }

  /// Record a fetched page under `key` and return the resulting page list.
  ///
  /// Page 1, or any page for a key without a page list, starts the list
  /// over. The page right after the last one loaded is appended. Other
  /// pages are out of order and left out. An accepted page resets the
  /// entry's age.
  pub fn append_page<T>(
    &self,
    key: &str,
    request: PageRequest,
    chunk: PageChunk<T>,
    ttl: Option<Duration>,
  ) -> PagedEntry<T>
  where
    T: Clone + Send + Sync + 'static,
  {
    let mut entries = self.lock();
    let current = entries
      .get(key)
      .and_then(|entry| entry.value.downcast_ref::<PagedEntry<T>>());

    let next = match current {
      Some(current) if request.page > 1 => match current.append(request, chunk) {
        Some(next) => next,
        None => {
          debug!(key, page = request.page, loaded = current.page, "out-of-order page ignored");
          return current.clone();
        }
      },
      _ => PagedEntry::first(request, chunk),
    };

    let ttl = ttl.unwrap_or(self.default_ttl);
    entries.insert(
      key.to_string(),
      CacheEntry {
        value: Arc::new(next.clone()),
        stored_at: Instant::now(),
        cached_at: Utc::now(),
        ttl,
      },
    );
    debug!(
      key,
      page = request.page,
      items = next.len(),
      has_more = next.has_more,
      "page stored"
    );
    next
  }

  /// The page to load next for `key`, if its page list has more.
  pub fn next_page<T>(&self, key: &str) -> Option<PageRequest>
  where
    T: Send + Sync + 'static,
  {
    self
      .lock()
      .get(key)?
      .value
      .downcast_ref::<PagedEntry<T>>()?
      .next_page()
  }

  /// Remove one entry. Returns whether it existed.
  pub fn delete(&self, key: &str) -> bool {
    self.lock().remove(key).is_some()
  }

  /// Remove every entry whose key satisfies `predicate`.
  pub fn delete_matching<P>(&self, predicate: P) -> usize
  where
    P: Fn(&str) -> bool,
  {
    let mut entries = self.lock();
    let before = entries.len();
    entries.retain(|key, _| !predicate(key));
    before - entries.len()
  }

  /// Remove all entries.
  pub fn clear(&self) -> usize {
    let mut entries = self.lock();
    let removed = entries.len();
    entries.clear();
    removed
  }

  /// Remove entries whose own TTL has elapsed.
  pub fn sweep(&self) -> usize {
    let now = Instant::now();
    let mut entries = self.lock();
    let before = entries.len();
    entries.retain(|_, entry| entry.is_fresh(now, entry.ttl));
    let removed = before - entries.len();
    if removed > 0 {
      debug!(removed, "swept stale cache entries");
    }
    removed
  }

  pub fn contains(&self, key: &str) -> bool {
    self.lock().contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  /// All stored keys, fresh or not, sorted.
  pub fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.lock().keys().cloned().collect();
    keys.sort();
    keys
  }

  /// Number of entries still fresh under their own TTL.
  pub fn fresh_count(&self) -> usize {
    let now = Instant::now();
    self
      .lock()
      .values()
      .filter(|entry| entry.is_fresh(now, entry.ttl))
      .count()
  }
}

impl Default for CacheStore {
  fn default() -> Self {
    Self::new(crate::config::DEFAULT_TTL)
  }
}

impl std::fmt::Debug for CacheStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheStore")
      .field("entries", &self.len())
      .field("default_ttl", &self.default_ttl)
      .finish()
  }
}
