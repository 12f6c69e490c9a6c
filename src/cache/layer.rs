//! Cache service tying the store and the in-flight registry together.

use color_eyre::Result;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::inflight::{FetchOutcome, Flight, FlightContext, InFlightRegistry};
use super::key::KeyMatcher;
use super::paged::{PageChunk, PageRequest, PagedEntry};
use super::store::CacheStore;
use super::traits::{CacheResult, QueryKey};
use crate::binding::CacheBinding;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{LoadError, LoadResult};
use crate::paged::PagedBinding;

/// Per-call knobs for [`Cache::fetch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchPolicy {
  /// Skip the store and always start a new fetch
  pub force: bool,
  /// TTL for this call; wins over every configured TTL
  pub ttl: Option<Duration>,
}

impl FetchPolicy {
  pub fn refresh() -> Self {
    Self {
      force: true,
      ttl: None,
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }
}

/// Point-in-time counters and sizes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub entries: usize,
  pub fresh_entries: usize,
  pub in_flight: usize,
  pub hits: u64,
  pub misses: u64,
  /// Fetches actually started
  pub fetches: u64,
  /// Callers that attached to a running fetch
  pub joins: u64,
  pub failures: u64,
  /// Callers that received the cancellation outcome
  pub cancellations: u64,
}

#[derive(Default)]
struct Counters {
  hits: AtomicU64,
  misses: AtomicU64,
  fetches: AtomicU64,
  joins: AtomicU64,
  failures: AtomicU64,
  cancellations: AtomicU64,
}

fn bump(counter: &AtomicU64) {
  counter.fetch_add(1, Ordering::Relaxed);
}

struct CacheInner {
  store: CacheStore,
  in_flight: InFlightRegistry,
  config: Config,
  counters: Counters,
  next_requester: AtomicU64,
}

/// Process-wide cache service.
///
/// Construct one at startup and hand clones to every consumer; clones share
/// the same store and registry. Tests build their own isolated instance.
#[derive(Clone)]
pub struct Cache {
  inner: Arc<CacheInner>,
}

impl Cache {
  pub fn new(config: Config) -> Self {
    Self {
      inner: Arc::new(CacheInner {
        store: CacheStore::new(config.default_ttl),
        in_flight: InFlightRegistry::new(),
        config,
        counters: Counters::default(),
        next_requester: AtomicU64::new(1),
      }),
    }
  }

  pub fn config(&self) -> &Config {
    &self.inner.config
  }

  pub fn store(&self) -> &CacheStore {
    &self.inner.store
  }

  pub fn in_flight(&self) -> &InFlightRegistry {
    &self.inner.in_flight
  }

  /// Effective TTL for `key`: explicit, then namespace rule, then default.
  pub fn resolve_ttl(&self, key: &str, explicit: Option<Duration>) -> Duration {
    explicit
      .or_else(|| self.inner.config.namespace_ttl(key))
      .unwrap_or(self.inner.config.default_ttl)
  }

  /// Read a fresh value without fetching.
  pub fn get<T>(&self, key: &str) -> Option<T>
  where
    T: Clone + Send + Sync + 'static,
  {
    self.inner.store.get(key, None)
  }

  /// Write a value directly, with the TTL resolved for `key`.
  pub fn set<T>(&self, key: &str, value: T, ttl: Option<Duration>)
  where
    T: Send + Sync + 'static,
  {
    let ttl = self.resolve_ttl(key, ttl);
    self.inner.store.set(key, value, Some(ttl));
  }

  /// Cache-first fetch with deduplication.
  ///
  /// 1. Unless forced, return a fresh stored value
  /// 2. Otherwise join the fetch running for this key, or start one
  /// 3. A successful fetch is stored before anyone sees it
  ///
  /// `Ok(None)` means this caller's fetch was cancelled.
  pub async fn fetch<K, T, F, Fut>(
    &self,
    key: &K,
    policy: FetchPolicy,
    fetcher: F,
  ) -> Result<Option<CacheResult<T>>, LoadError>
  where
    K: QueryKey + ?Sized,
    T: Clone + Send + Sync + 'static,
    F: FnOnce(CancelToken) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let description = key.description();
    let key = key.cache_key();
    debug!(key, what = %description, force = policy.force, "fetch requested");
    if !policy.force {
      if let Some(hit) = self.lookup(&key, policy.ttl) {
        return Ok(Some(hit));
      }
    }

    let flight = self.start_flight(&key, policy, self.next_requester(), fetcher);
    let joined = flight.joined();
    let outcome = flight.wait().await;
    self.settle(&key, joined, outcome)
  }

  /// Fresh value from the store, counted as a hit or miss.
  pub(crate) fn lookup<T>(&self, key: &str, ttl: Option<Duration>) -> Option<CacheResult<T>>
  where
    T: Clone + Send + Sync + 'static,
  {
    match self.inner.store.get_entry::<T>(key, ttl) {
      Some(cached) => {
        bump(&self.inner.counters.hits);
        debug!(key, "cache hit");
        Some(CacheResult::from_cache(cached.value, cached.cached_at))
      }
      None => {
        bump(&self.inner.counters.misses);
        debug!(key, "cache miss");
        None
      }
    }
  }

  /// Identity for a caller of forced fetches.
  pub(crate) fn next_requester(&self) -> u64 {
    self.inner.next_requester.fetch_add(1, Ordering::Relaxed)
  }

  /// Join or start the fetch for `key`.
  ///
  /// A forced policy never joins an ordinary fetch or one started by the same
  /// `requester`, but does share a forced fetch other requesters started.
  pub(crate) fn start_flight<T, F, Fut>(
    &self,
    key: &str,
    policy: FetchPolicy,
    requester: u64,
    fetcher: F,
  ) -> Flight<T>
  where
    T: Clone + Send + Sync + 'static,
    F: FnOnce(CancelToken) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let ttl = self.resolve_ttl(key, policy.ttl);
    let inner = Arc::clone(&self.inner);

    let operation = move |ctx: FlightContext| {
      let fetch = fetcher(ctx.token.clone());
      async move {
        match fetch.await {
          Ok(value) => {
            let stored = inner.in_flight.commit(&ctx.key, ctx.id, || {
              inner.store.set(&ctx.key, value.clone(), Some(ttl));
            });
            if !stored {
              debug!(key = %ctx.key, flight = ctx.id, "newer fetch already stored, result dropped");
            }
            FetchOutcome::Value(value)
          }
          Err(report) => {
            bump(&inner.counters.failures);
            warn!(key = %ctx.key, flight = ctx.id, error = %report, "fetch failed");
            FetchOutcome::Failed(LoadError::operation(&ctx.key, report))
          }
        }
      }
    };

    let flight = if policy.force {
      self.inner.in_flight.refresh(key, requester, operation)
    } else {
      self.inner.in_flight.begin(key, operation)
    };
    self.count_flight(&flight);
    flight
  }

  fn count_flight<T: Clone>(&self, flight: &Flight<T>) {
    if flight.joined() {
      bump(&self.inner.counters.joins);
    } else {
      bump(&self.inner.counters.fetches);
    }
  }

  /// Fetch one page of `key` and fold it into the page list stored there.
  ///
  /// Callers asking for the same page of the same key at once share one
  /// fetch. The page list is only written through
  /// [`CacheStore::append_page`], so pages arriving out of order are left out.
  pub async fn fetch_page<T, F, Fut>(
    &self,
    key: &str,
    request: PageRequest,
    ttl: Option<Duration>,
    fetcher: F,
  ) -> LoadResult<PagedEntry<T>>
  where
    T: Clone + Send + Sync + 'static,
    F: FnOnce(PageRequest, CancelToken) -> Fut,
    Fut: Future<Output = Result<PageChunk<T>>> + Send + 'static,
  {
    let ttl = self.resolve_ttl(key, ttl);
    let flight_key = format!("{}#page={}", key, request.page);
    let store_key = key.to_string();
    let inner = Arc::clone(&self.inner);

    let flight = self.inner.in_flight.begin(&flight_key, move |ctx: FlightContext| {
      let fetch = fetcher(request, ctx.token.clone());
      async move {
        match fetch.await {
          Ok(chunk) => {
            FetchOutcome::Value(inner.store.append_page(&store_key, request, chunk, Some(ttl)))
          }
          Err(report) => {
            bump(&inner.counters.failures);
            warn!(key = %store_key, page = request.page, error = %report, "page fetch failed");
            FetchOutcome::Failed(LoadError::operation(&store_key, report))
          }
        }
      }
    });
    self.count_flight(&flight);

    let joined = flight.joined();
    let outcome = flight.wait().await;
    self
      .settle(&flight_key, joined, outcome)
      .map(|result| result.map(|r| r.data))
  }

  /// Turn a flight outcome into what a caller sees.
  pub(crate) fn settle<T>(
    &self,
    key: &str,
    joined: bool,
    outcome: FetchOutcome<T>,
  ) -> Result<Option<CacheResult<T>>, LoadError> {
    match outcome {
      FetchOutcome::Value(value) if joined => Ok(Some(CacheResult::joined(value))),
      FetchOutcome::Value(value) => Ok(Some(CacheResult::from_network(value))),
      FetchOutcome::Failed(e) => Err(e),
      FetchOutcome::Cancelled => {
        self.record_cancellation(key);
        Ok(None)
      }
    }
  }

  pub(crate) fn record_cancellation(&self, key: &str) {
    bump(&self.inner.counters.cancellations);
    debug!(key, "load cancelled");
  }

  /// Create a binding for `key`, started and ready to load.
  pub fn bind<K, T, F, Fut>(&self, key: K, fetcher: F) -> CacheBinding<T>
  where
    K: QueryKey,
    T: Clone + Send + Sync + 'static,
    F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    CacheBinding::new(self.clone(), key.cache_key(), fetcher)
  }

  /// Create a paged binding for `key`, fetching `page_size` items per page.
  pub fn paged<K, T, F, Fut>(&self, key: K, page_size: u32, fetcher: F) -> PagedBinding<T>
  where
    K: QueryKey,
    T: Clone + Send + Sync + 'static,
    F: Fn(PageRequest, CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<PageChunk<T>>> + Send + 'static,
  {
    PagedBinding::new(self.clone(), key.cache_key(), page_size, fetcher)
  }

  /// Drop the entry for one key. Running fetches are untouched.
  pub fn invalidate(&self, key: &str) -> bool {
    let removed = self.inner.store.delete(key);
    debug!(key, removed, "invalidated");
    removed
  }

  /// Drop every entry.
  pub fn invalidate_all(&self) -> usize {
    let removed = self.inner.store.clear();
    info!(removed, "invalidated all cache entries");
    removed
  }

  /// Drop every entry whose key matches.
  ///
  /// Running fetches for matching keys are untouched and will repopulate
  /// the store when they finish.
  pub fn invalidate_by_pattern(&self, matcher: impl Into<KeyMatcher>) -> usize {
    let matcher = matcher.into();
    let removed = self.inner.store.delete_matching(|key| matcher.matches(key));
    info!(removed, matcher = ?matcher, "invalidated cache entries by pattern");
    removed
  }

  /// Drop every entry for which `predicate` returns true.
  pub fn invalidate_where<P>(&self, predicate: P) -> usize
  where
    P: Fn(&str) -> bool,
  {
    let removed = self.inner.store.delete_matching(predicate);
    info!(removed, "invalidated cache entries by predicate");
    removed
  }

  /// Drop entries whose TTL has elapsed.
  pub fn sweep(&self) -> usize {
    self.inner.store.sweep()
  }

  /// Sweep periodically until every clone of this cache is dropped.
  ///
  /// Returns `None` when the configured sweep interval is zero.
  pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
    let period = self.inner.config.sweep_interval;
    if period.is_zero() {
      return None;
    }

    let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
    Some(tokio::spawn(async move {
      let mut ticker = interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          debug!("cache dropped, sweeper exiting");
          break;
        };
        inner.store.sweep();
      }
    }))
  }

  pub fn stats(&self) -> CacheStats {
    let counters = &self.inner.counters;
    CacheStats {
      entries: self.inner.store.len(),
      fresh_entries: self.inner.store.fresh_count(),
      in_flight: self.inner.in_flight.len(),
      hits: counters.hits.load(Ordering::Relaxed),
      misses: counters.misses.load(Ordering::Relaxed),
      fetches: counters.fetches.load(Ordering::Relaxed),
      joins: counters.joins.load(Ordering::Relaxed),
      failures: counters.failures.load(Ordering::Relaxed),
      cancellations: counters.cancellations.load(Ordering::Relaxed),
    }
  }
}

impl Default for Cache {
  fn default() -> Self {
    Self::new(Config::default())
  }
}

impl std::fmt::Debug for Cache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Cache")
      .field("store", &self.inner.store)
      .field("in_flight", &self.inner.in_flight)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheKey, CacheSource};
  use color_eyre::eyre::eyre;
  use std::sync::atomic::AtomicU32;

  const TTL: Duration = Duration::from_secs(30);

  fn cache() -> Cache {
    Cache::new(Config::default().with_default_ttl(TTL))
  }

  /// Fetcher that counts calls and answers `value` after `delay`.
  fn counted(
    calls: &Arc<AtomicU32>,
    value: &str,
    delay: Duration,
  ) -> impl FnOnce(CancelToken) -> futures::future::BoxFuture<'static, Result<String>> {
    use futures::FutureExt;
    let calls = Arc::clone(calls);
    let value = value.to_string();
    move |_token| {
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        Ok(value)
      }
      .boxed()
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_fetches_run_once() {
    let cache = cache();
    let calls = Arc::new(AtomicU32::new(0));
    let delay = Duration::from_millis(100);

    let (a, b, c) = tokio::join!(
      cache.fetch("listings", FetchPolicy::default(), counted(&calls, "v1", delay)),
      cache.fetch("listings", FetchPolicy::default(), counted(&calls, "v2", delay)),
      cache.fetch("listings", FetchPolicy::default(), counted(&calls, "v3", delay)),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let a = a.unwrap().unwrap();
    let b = b.unwrap().unwrap();
    let c = c.unwrap().unwrap();
    assert_eq!(a.data, "v1");
    assert_eq!(b.data, "v1");
    assert_eq!(c.data, "v1");
    assert_eq!(a.source, CacheSource::Network);
    assert_eq!(b.source, CacheSource::Joined);

    let stats = cache.stats();
    assert_eq!(stats.fetches, 1);
    assert_eq!(stats.joins, 2);
    assert_eq!(stats.in_flight, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_hit_skips_fetch() {
    let cache = cache();
    let calls = Arc::new(AtomicU32::new(0));

    cache
      .fetch("k", FetchPolicy::default(), counted(&calls, "v", Duration::ZERO))
      .await
      .unwrap();
    let second = cache
      .fetch("k", FetchPolicy::default(), counted(&calls, "w", Duration::ZERO))
      .await
      .unwrap()
      .unwrap();

    assert_eq!(second.data, "v");
    assert_eq!(second.source, CacheSource::Cache);
    assert!(second.cached_at.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().hits, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_expired_entry_refetches() {
    let cache = cache();
    let calls = Arc::new(AtomicU32::new(0));
    cache.set("x", "old".to_string(), Some(TTL));

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(cache.get::<String>("x"), None);

    let result = cache
      .fetch("x", FetchPolicy::default(), counted(&calls, "new", Duration::ZERO))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(result.data, "new");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_force_bypasses_fresh_entry() {
    let cache = cache();
    let calls = Arc::new(AtomicU32::new(0));
    cache.set("k", "cached".to_string(), None);

    let result = cache
      .fetch("k", FetchPolicy::refresh(), counted(&calls, "fresh", Duration::ZERO))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(result.data, "fresh");
    assert_eq!(cache.get::<String>("k").as_deref(), Some("fresh"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_keeps_previous_value() {
    let cache = cache();
    cache.set("k", "good".to_string(), None);

    let err = cache
      .fetch("k", FetchPolicy::refresh(), |_token| async {
        Err::<String, _>(eyre!("remote unavailable"))
      })
      .await
      .unwrap_err();

    assert_eq!(err.key(), "k");
    assert_eq!(cache.get::<String>("k").as_deref(), Some("good"));
    assert!(cache.in_flight().is_empty());
    assert_eq!(cache.stats().failures, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_forced_fetches_run_once() {
    let cache = cache();
    let calls = Arc::new(AtomicU32::new(0));
    let delay = Duration::from_millis(50);
    cache.set("k", "cached".to_string(), None);

    let (a, b, c) = tokio::join!(
      cache.fetch("k", FetchPolicy::refresh(), counted(&calls, "r1", delay)),
      cache.fetch("k", FetchPolicy::refresh(), counted(&calls, "r2", delay)),
      cache.fetch("k", FetchPolicy::refresh(), counted(&calls, "r3", delay)),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in [a, b, c] {
      assert_eq!(result.unwrap().unwrap().data, "r1");
    }
    assert_eq!(cache.get::<String>("k").as_deref(), Some("r1"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_refresh_does_not_discard_running_fetch() {
    let cache = cache();
    let calls = Arc::new(AtomicU32::new(0));

    let (slow, forced) = tokio::join!(
      cache.fetch("k", FetchPolicy::default(), counted(&calls, "slow", Duration::from_millis(100))),
      async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache
          .fetch("k", FetchPolicy::refresh(), |_token| async {
            Err::<String, _>(eyre!("remote unavailable"))
          })
          .await
      },
    );

    assert!(forced.is_err());
    assert_eq!(slow.unwrap().unwrap().data, "slow");
    // The replaced fetch still lands in the store
    assert_eq!(cache.get::<String>("k").as_deref(), Some("slow"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_newer_result_wins_over_slower_older_fetch() {
    let cache = cache();
    let calls = Arc::new(AtomicU32::new(0));

    let (old, new) = tokio::join!(
      cache.fetch("k", FetchPolicy::default(), counted(&calls, "old", Duration::from_millis(100))),
      async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache
          .fetch("k", FetchPolicy::refresh(), counted(&calls, "new", Duration::from_millis(20)))
          .await
      },
    );

    assert_eq!(old.unwrap().unwrap().data, "old");
    assert_eq!(new.unwrap().unwrap().data, "new");
    assert_eq!(cache.get::<String>("k").as_deref(), Some("new"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_does_not_touch_other_keys() {
    let cache = cache();
    cache.set("other", 1u32, None);

    let _ = cache
      .fetch("k", FetchPolicy::default(), |_token| async {
        Err::<u32, _>(eyre!("boom"))
      })
      .await;

    assert_eq!(cache.get::<u32>("other"), Some(1));
    assert_eq!(cache.get::<u32>("k"), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_token_reaches_fetcher() {
    let cache = cache();
    let requester = cache.next_requester();
    let flight = cache.start_flight::<u32, _, _>("k", FetchPolicy::default(), requester, |token| async move {
      tokio::time::sleep(Duration::from_secs(1)).await;
      Ok(if token.is_cancelled() { 0 } else { 1 })
    });
    let token = flight.token().clone();

    token.cancel();
    assert!(matches!(flight.wait().await, FetchOutcome::Cancelled));
    assert!(cache.get::<u32>("k").is_none());
  }

  #[tokio::test]
  async fn test_pattern_invalidation_removes_exact_set() {
    let cache = cache();
    for key in ["received_42", "sent_42", "received_7"] {
      cache.set(key, key.to_string(), None);
    }

    let removed = cache.invalidate_by_pattern(KeyMatcher::regex("^received_").unwrap());
    assert_eq!(removed, 2);
    assert_eq!(cache.store().keys(), vec!["sent_42".to_string()]);
  }

  #[tokio::test]
  async fn test_substring_and_predicate_invalidation() {
    let cache = cache();
    let project_key = CacheKey::new("listings").param("project", 7).cache_key();
    let other_key = CacheKey::new("listings").param("project", 8).cache_key();
    cache.set(&project_key, 1u8, None);
    cache.set(&other_key, 2u8, None);
    cache.set("farms:project=7", 3u8, None);

    assert_eq!(cache.invalidate_by_pattern("project=7"), 2);
    assert_eq!(cache.store().keys(), vec![other_key.clone()]);

    assert_eq!(cache.invalidate_where(|k| k.starts_with("listings")), 1);
    assert!(cache.store().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_pattern_invalidation_leaves_running_fetch() {
    let cache = cache();
    let calls = Arc::new(AtomicU32::new(0));

    let pending = cache.fetch(
      "received_1",
      FetchPolicy::default(),
      counted(&calls, "v", Duration::from_millis(50)),
    );
    let invalidate = async {
      tokio::time::sleep(Duration::from_millis(10)).await;
      cache.invalidate_by_pattern(KeyMatcher::prefix("received_"));
      assert!(cache.in_flight().contains("received_1"));
    };
    let (result, ()) = tokio::join!(pending, invalidate);

    assert_eq!(result.unwrap().unwrap().data, "v");
    // The fetch repopulated the store after the invalidation
    assert_eq!(cache.get::<String>("received_1").as_deref(), Some("v"));
  }

  #[tokio::test]
  async fn test_invalidate_all() {
    let cache = cache();
    cache.set("a", 1u8, None);
    cache.set("b", 2u8, None);
    assert_eq!(cache.invalidate_all(), 2);
    assert!(!cache.invalidate("a"));
    assert_eq!(cache.stats().entries, 0);
  }

  #[tokio::test]
  async fn test_ttl_resolution_order() {
    let config = Config::default()
      .with_default_ttl(TTL)
      .with_namespace_ttl("listings", Duration::from_secs(300));
    let cache = Cache::new(config);

    assert_eq!(cache.resolve_ttl("farms", None), TTL);
    assert_eq!(
      cache.resolve_ttl("listings:page=1", None),
      Duration::from_secs(300)
    );
    assert_eq!(
      cache.resolve_ttl("listings:page=1", Some(Duration::from_secs(1))),
      Duration::from_secs(1)
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_sweeper_drops_stale_entries() {
    let config = Config {
      sweep_interval: Duration::from_secs(60),
      ..Config::default()
    };
    let cache = Cache::new(config);
    cache.set("short", 1u8, Some(Duration::from_secs(1)));
    cache.set("long", 2u8, Some(Duration::from_secs(600)));

    let sweeper = cache.spawn_sweeper().unwrap();
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(cache.store().keys(), vec!["long".to_string()]);
    sweeper.abort();
  }

  #[tokio::test]
  async fn test_sweeper_disabled() {
    let config = Config {
      sweep_interval: Duration::ZERO,
      ..Config::default()
    };
    assert!(Cache::new(config).spawn_sweeper().is_none());
  }
}
