//! Per-consumer view of one cache key.
//!
//! Inspired by TanStack Query, a `CacheBinding<T>` ties a fetch operation,
//! a key and a TTL to the shared [`Cache`], and tracks the loading, success
//! and error state a presentation layer renders.
//!
//! # Example
//!
//! ```ignore
//! let api = api_client.clone();
//! let listings = cache.bind(CacheKey::new("listings").param("status", "open"), move |_token| {
//!     let api = api.clone();
//!     async move { api.listings("open").await }
//! });
//!
//! // Cache first, deduplicated against other consumers of the same key
//! let value = listings.load(false).await?;
//!
//! // Render from the snapshot channel
//! let mut rx = listings.subscribe();
//! rx.changed().await?;
//! render(&rx.borrow());
//!
//! // Consumer went away: cancel what it started, keep the shared entry
//! listings.stop();
//! ```

use chrono::{DateTime, Utc};
use color_eyre::Result;
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::cache::{Cache, FetchOutcome, FetchPolicy};
use crate::cancel::CancelToken;
use crate::error::{run_callback, LoadError, LoadResult};

/// Where a binding is in its load cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingStatus {
  /// Nothing loaded yet, or the last load failed
  Idle,
  /// A load is running
  Fetching,
  /// Holding a value that was fresh when read
  Cached,
  /// The held value's entry went stale and a reload started
  Expired,
  /// The entry was invalidated through this binding
  Evicted,
}

/// What a presentation layer renders for a binding.
#[derive(Debug, Clone)]
pub struct BindingSnapshot<T> {
  /// Last good value; kept when a later load fails
  pub value: Option<T>,
  pub is_loading: bool,
  pub last_error: Option<LoadError>,
  pub status: BindingStatus,
  /// When `value` was produced
  pub updated_at: Option<DateTime<Utc>>,
}

impl<T> Default for BindingSnapshot<T> {
  fn default() -> Self {
    Self {
      value: None,
      is_loading: false,
      last_error: None,
      status: BindingStatus::Idle,
      updated_at: None,
    }
  }
}

impl<T> BindingSnapshot<T> {
  pub fn data(&self) -> Option<&T> {
    self.value.as_ref()
  }

  pub fn is_error(&self) -> bool {
    self.last_error.is_some()
  }
}

/// A boxed fetch operation producing `T`
type FetcherFn<T> = Arc<dyn Fn(CancelToken) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// A post-load side effect
type LoadHook<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Control {
  alive: bool,
  /// Bumped by every forced refresh; older forced loads give up
  generation: u64,
}

struct BindingInner<T> {
  cache: Cache,
  /// Identifies this binding's forced fetches in the registry
  requester: u64,
  key: String,
  fetcher: FetcherFn<T>,
  ttl: Mutex<Option<Duration>>,
  hooks: Mutex<Vec<LoadHook<T>>>,
  control: watch::Sender<Control>,
  snapshot: watch::Sender<BindingSnapshot<T>>,
  /// Loads of this binding currently awaiting a fetch
  pending: AtomicUsize,
  auto_refresh: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> Drop for BindingInner<T> {
  fn drop(&mut self) {
    if let Some(task) = lock(&self.auto_refresh).take() {
      task.abort();
    }
  }
}

/// One consumer's subscription to a cache key.
///
/// Cloning yields another handle to the same binding. The binding is live
/// from creation; `stop()` tears it down and `start()` re-arms it.
pub struct CacheBinding<T> {
  inner: Arc<BindingInner<T>>,
}

impl<T> Clone for CacheBinding<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Clone + Send + Sync + 'static> CacheBinding<T> {
  /// Create a live binding. Usually reached through [`Cache::bind`].
  pub fn new<F, Fut>(cache: Cache, key: impl Into<String>, fetcher: F) -> Self
  where
    F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let (control, _) = watch::channel(Control {
      alive: true,
      generation: 0,
    });
    let (snapshot, _) = watch::channel(BindingSnapshot::default());

    Self {
      inner: Arc::new(BindingInner {
        requester: cache.next_requester(),
        cache,
        key: key.into(),
        fetcher: Arc::new(move |token| fetcher(token).boxed()),
        ttl: Mutex::new(None),
        hooks: Mutex::new(Vec::new()),
        control,
        snapshot,
        pending: AtomicUsize::new(0),
        auto_refresh: Mutex::new(None),
      }),
    }
  }

  /// Set the TTL this binding stores with and judges freshness by.
  pub fn with_ttl(self, ttl: Duration) -> Self {
    *lock(&self.inner.ttl) = Some(ttl);
    self
  }

  /// Run `hook` after every successful load while the binding is live.
  ///
  /// Hook errors and panics are logged and otherwise ignored.
  pub fn on_loaded<H>(self, hook: H) -> Self
  where
    H: Fn(&T) -> Result<()> + Send + Sync + 'static,
  {
    lock(&self.inner.hooks).push(Arc::new(hook));
    self
  }

  pub fn key(&self) -> &str {
    &self.inner.key
  }

  /// Whether the consumer still wants updates.
  pub fn is_active(&self) -> bool {
    self.inner.control.borrow().alive
  }

  /// Current state for rendering.
  pub fn snapshot(&self) -> BindingSnapshot<T> {
    self.inner.snapshot.borrow().clone()
  }

  /// Receive every state change.
  pub fn subscribe(&self) -> watch::Receiver<BindingSnapshot<T>> {
    self.inner.snapshot.subscribe()
  }

  pub fn value(&self) -> Option<T> {
    self.inner.snapshot.borrow().value.clone()
  }

  pub fn is_loading(&self) -> bool {
    self.inner.snapshot.borrow().is_loading
  }

  pub fn last_error(&self) -> Option<LoadError> {
    self.inner.snapshot.borrow().last_error.clone()
  }

  pub fn status(&self) -> BindingStatus {
    self.inner.snapshot.borrow().status
  }

  /// Load the value, cache first unless `force_refresh`.
  ///
  /// Concurrent loads of the same key share one fetch. Returns `Ok(None)`
  /// when this load was cancelled: the binding was stopped, or a newer
  /// forced refresh of this binding superseded it.
  pub async fn load(&self, force_refresh: bool) -> LoadResult<T> {
    let inner = &self.inner;
    let control = *inner.control.borrow();
    if !control.alive {
      inner.cache.record_cancellation(&inner.key);
      return Ok(None);
    }

    let ttl = *lock(&inner.ttl);
    if !force_refresh {
      if let Some(hit) = inner.cache.lookup::<T>(&inner.key, ttl) {
        self.publish(|s| {
          s.value = Some(hit.data.clone());
          s.status = BindingStatus::Cached;
          s.last_error = None;
          s.updated_at = hit.cached_at;
        });
        self.run_hooks(&hit.data);
        return Ok(Some(hit.data));
      }
      self.publish(|s| {
        if s.status == BindingStatus::Cached {
          s.status = BindingStatus::Expired;
        }
      });
    }

    let mut generation = control.generation;
    if force_refresh {
      inner.control.send_modify(|c| {
        c.generation += 1;
        generation = c.generation;
      });
    }

    inner.pending.fetch_add(1, Ordering::AcqRel);
    self.publish(|s| {
      s.is_loading = true;
      s.status = BindingStatus::Fetching;
    });

    let fetcher = Arc::clone(&inner.fetcher);
    let policy = FetchPolicy {
      force: force_refresh,
      ttl,
    };
    let flight = inner
      .cache
      .start_flight(&inner.key, policy, inner.requester, move |token| fetcher(token));
    let joined = flight.joined();

    // Losing the race drops the flight and with it this binding's interest.
    let outcome = tokio::select! {
      outcome = flight.wait() => outcome,
      () = self.interrupted(force_refresh, generation) => FetchOutcome::Cancelled,
    };

    let still_loading = inner.pending.fetch_sub(1, Ordering::AcqRel) > 1;
    match inner.cache.settle(&inner.key, joined, outcome) {
      Ok(Some(result)) => {
        self.publish(|s| {
          s.value = Some(result.data.clone());
          s.is_loading = still_loading;
          s.last_error = None;
          s.status = BindingStatus::Cached;
          s.updated_at = Some(Utc::now());
        });
        self.run_hooks(&result.data);
        Ok(Some(result.data))
      }
      Ok(None) => {
        self.publish(|s| {
          s.is_loading = still_loading;
          if !still_loading && s.status == BindingStatus::Fetching {
            s.status = if s.value.is_some() {
              BindingStatus::Cached
            } else {
              BindingStatus::Idle
            };
          }
        });
        Ok(None)
      }
      Err(e) => {
        self.publish(|s| {
          s.is_loading = still_loading;
          s.last_error = Some(e.clone());
          s.status = BindingStatus::Idle;
        });
        Err(e)
      }
    }
  }

  /// Always fetch, whatever the store holds.
  pub async fn refresh(&self) -> LoadResult<T> {
    self.load(true).await
  }

  /// Start a load without waiting for it; observe the result via `subscribe`.
  pub fn spawn_load(&self, force_refresh: bool) -> JoinHandle<LoadResult<T>> {
    let binding = self.clone();
    tokio::spawn(async move { binding.load(force_refresh).await })
  }

  /// Drop the stored entry for this key. Running fetches are untouched.
  pub fn invalidate(&self) {
    self.inner.cache.invalidate(&self.inner.key);
    self.publish(|s| s.status = BindingStatus::Evicted);
  }

  /// Refresh every `period` until the binding stops or is dropped.
  ///
  /// Replaces any previously enabled schedule.
  pub fn enable_auto_refresh(&self, period: Duration) {
    if period.is_zero() {
      warn!(key = %self.inner.key, "ignoring zero auto-refresh period");
      return;
    }

    let weak = Arc::downgrade(&self.inner);
    let task = tokio::spawn(async move {
      let mut ticker = interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        let binding = CacheBinding { inner };
        if !binding.is_active() {
          break;
        }
        if let Err(e) = binding.refresh().await {
          debug!(key = %binding.inner.key, error = %e, "auto-refresh failed");
        }
      }
    });

    if let Some(previous) = lock(&self.inner.auto_refresh).replace(task) {
      previous.abort();
    }
  }

  /// Stop any auto-refresh schedule.
  pub fn disable_auto_refresh(&self) {
    if let Some(task) = lock(&self.inner.auto_refresh).take() {
      task.abort();
    }
  }

  /// (Re)activate the binding after `stop`.
  ///
  /// State frozen by `stop` is brought up to date: loads abandoned while
  /// stopped no longer count as loading.
  pub fn start(&self) {
    self.inner.control.send_modify(|c| c.alive = true);
    let loading = self.inner.pending.load(Ordering::Acquire) > 0;
    self.publish(|s| {
      s.is_loading = loading;
      if !loading && s.status == BindingStatus::Fetching {
        s.status = if s.value.is_some() {
          BindingStatus::Cached
        } else {
          BindingStatus::Idle
        };
      }
    });
  }

  /// Tear down: cancel this binding's pending loads and its auto-refresh.
  ///
  /// Shared entries and fetches other consumers still await are left alone;
  /// a fetch is only cancelled once nobody is waiting on it.
  pub fn stop(&self) {
    let mut was_alive = false;
    self.inner.control.send_modify(|c| {
      was_alive = c.alive;
      c.alive = false;
    });
    self.disable_auto_refresh();
    if was_alive {
      debug!(key = %self.inner.key, "binding stopped");
    }
  }

  /// Resolves when a load started at `generation` should give up.
  async fn interrupted(&self, forced: bool, generation: u64) {
    let mut rx = self.inner.control.subscribe();
    loop {
      let give_up = {
        let c = rx.borrow_and_update();
        !c.alive || (forced && c.generation != generation)
      };
      if give_up || rx.changed().await.is_err() {
        return;
      }
    }
  }

  /// Apply a state change unless the consumer has gone away.
  fn publish<F>(&self, update: F)
  where
    F: FnOnce(&mut BindingSnapshot<T>),
  {
    if !self.is_active() {
      return;
    }
    self.inner.snapshot.send_modify(update);
  }

  fn run_hooks(&self, value: &T) {
    if !self.is_active() {
      return;
    }
    let hooks: Vec<LoadHook<T>> = lock(&self.inner.hooks).clone();
    for hook in hooks {
      run_callback("load hook", &self.inner.key, || hook(value));
    }
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CacheBinding<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheBinding")
      .field("key", &self.inner.key)
      .field("snapshot", &*self.inner.snapshot.borrow())
      .finish_non_exhaustive()
  }
}
