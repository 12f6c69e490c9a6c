//! Registry of fetches currently running, keyed like the store.
//!
//! Each fetch runs in its own spawned task and publishes its outcome through
//! a shared future, so any number of callers can await the same fetch. The
//! task removes the registry entry itself when the fetch finishes, whether
//! or not anyone is still waiting.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{panic_message, LoadError};

/// How a fetch ended, as delivered to every caller awaiting it.
#[derive(Debug, Clone)]
pub enum FetchOutcome<T> {
  Value(T),
  Failed(LoadError),
  Cancelled,
}

/// Handle shared by all callers of one fetch.
pub type FlightFuture<T> = Shared<BoxFuture<'static, FetchOutcome<T>>>;

/// What a fetch operation is told about the flight it runs in.
#[derive(Debug, Clone)]
pub struct FlightContext {
  pub key: String,
  pub id: u64,
  pub token: CancelToken,
}

struct FlightState {
  id: u64,
  key: String,
  token: CancelToken,
  /// Callers still awaiting this flight. Only changed under the registry lock.
  interest: AtomicUsize,
  finished: AtomicBool,
  started_at: Instant,
  /// Requester of a forced fetch; `None` for ordinary fetches
  forced_by: Option<u64>,
}

struct InFlightEntry {
  state: Arc<FlightState>,
  /// A `FlightFuture<T>` for the value type of whoever started the fetch
  handle: Box<dyn Any + Send + Sync>,
}

/// Store-write ordering for one key.
#[derive(Default)]
struct WriteMark {
  /// Highest flight id that committed a result
  last_written: u64,
  /// Flights of this key whose driver has not finished, detached ones included
  running: usize,
}

#[derive(Default)]
struct RegistryInner {
  entries: Mutex<HashMap<String, InFlightEntry>>,
  writes: Mutex<HashMap<String, WriteMark>>,
  next_id: AtomicU64,
}

impl RegistryInner {
  fn lock(&self) -> MutexGuard<'_, HashMap<String, InFlightEntry>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn writes(&self) -> MutexGuard<'_, HashMap<String, WriteMark>> {
    self.writes.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn track(&self, key: &str) {
    self.writes().entry(key.to_string()).or_default().running += 1;
  }

  fn untrack(&self, key: &str) {
    let mut writes = self.writes();
    if let Some(mark) = writes.get_mut(key) {
      mark.running = mark.running.saturating_sub(1);
      if mark.running == 0 {
        writes.remove(key);
      }
    }
  }

  /// Remove the entry for `key` if it still belongs to flight `id`.
  fn finish(&self, key: &str, id: u64) -> bool {
    let mut entries = self.lock();
    match entries.get(key) {
      Some(entry) if entry.state.id == id => {
        let elapsed = entry.state.started_at.elapsed();
        entries.remove(key);
        debug!(key, flight = id, elapsed_ms = elapsed.as_millis() as u64, "fetch finished");
        true
      }
      _ => false,
    }
  }

  fn release(&self, flight: &FlightState) {
    let _entries = self.lock();
    let previous = flight.interest.fetch_sub(1, Ordering::AcqRel);
    if previous == 1 && !flight.finished.load(Ordering::Acquire) {
      debug!(key = %flight.key, flight = flight.id, "no callers left, cancelling fetch");
      flight.token.cancel();
    }
  }
}

/// A caller's claim on a flight.
///
/// The flight's token is raised when the last claim is dropped before the
/// fetch finishes.
pub struct Interest {
  registry: Arc<RegistryInner>,
  flight: Arc<FlightState>,
}

impl Drop for Interest {
  fn drop(&mut self) {
    self.registry.release(&self.flight);
  }
}

/// One caller's view of a running fetch.
pub struct Flight<T> {
  handle: FlightFuture<T>,
  interest: Interest,
  joined: bool,
}

impl<T: Clone> Flight<T> {
  pub fn id(&self) -> u64 {
    self.interest.flight.id
  }

  /// Whether this caller attached to a fetch someone else started.
  pub fn joined(&self) -> bool {
    self.joined
  }

  pub fn token(&self) -> &CancelToken {
    &self.interest.flight.token
  }

  /// Wait for the fetch to end. Dropping this future withdraws the caller's interest.
  pub async fn wait(self) -> FetchOutcome<T> {
    let Flight {
      handle, interest, ..
    } = self;
    let outcome = handle.await;
    drop(interest);
    outcome
  }
}

/// Tracks at most one running fetch per key.
#[derive(Clone, Default)]
pub struct InFlightRegistry {
  inner: Arc<RegistryInner>,
}

impl InFlightRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Join the fetch running for `key`, or start one with `operation`.
  ///
  /// `operation` is only invoked when no usable fetch is registered. A
  /// registered fetch whose token was already raised is not joined.
  pub fn begin<T, F, Fut>(&self, key: &str, operation: F) -> Flight<T>
  where
    T: Clone + Send + Sync + 'static,
    F: FnOnce(FlightContext) -> Fut,
    Fut: Future<Output = FetchOutcome<T>> + Send + 'static,
  {
    let entries = self.inner.lock();

    if let Some(entry) = entries.get(key) {
      if !entry.state.token.is_cancelled() {
        if let Some(flight) = self.try_join(key, entry) {
          return flight;
        }
        warn!(
          key,
          expected = std::any::type_name::<T>(),
          "in-flight fetch has a different type, running an untracked fetch"
        );
        drop(entries);
        return self.launch(key, operation, None, None);
      }
    }

    self.launch(key, operation, None, Some(entries))
  }

  /// Start a forced fetch for `key` on behalf of `requester`.
  ///
  /// A running forced fetch started by another requester is joined, so
  /// several consumers refreshing at once share one fetch. An ordinary
  /// fetch, or a forced one this requester started itself, is detached and
  /// replaced as with [`replace`](Self::replace).
  pub fn refresh<T, F, Fut>(&self, key: &str, requester: u64, operation: F) -> Flight<T>
  where
    T: Clone + Send + Sync + 'static,
    F: FnOnce(FlightContext) -> Fut,
    Fut: Future<Output = FetchOutcome<T>> + Send + 'static,
  {
    let mut entries = self.inner.lock();

    if let Some(entry) = entries.get(key) {
      let shareable = !entry.state.token.is_cancelled()
        && entry.state.forced_by.is_some_and(|origin| origin != requester);
      if shareable {
        if let Some(flight) = self.try_join(key, entry) {
          return flight;
        }
      }
    }

    if let Some(previous) = entries.remove(key) {
      debug!(key, flight = previous.state.id, "superseding in-flight fetch");
    }
    self.launch(key, operation, Some(requester), Some(entries))
  }

  /// Start a new fetch for `key` even if one is running.
  ///
  /// The previous fetch is detached: it keeps serving the callers already
  /// awaiting it, but it is no longer joinable.
  pub fn replace<T, F, Fut>(&self, key: &str, operation: F) -> Flight<T>
  where
    T: Clone + Send + Sync + 'static,
    F: FnOnce(FlightContext) -> Fut,
    Fut: Future<Output = FetchOutcome<T>> + Send + 'static,
  {
    let mut entries = self.inner.lock();
    if let Some(previous) = entries.remove(key) {
      debug!(key, flight = previous.state.id, "superseding in-flight fetch");
    }
    self.launch(key, operation, None, Some(entries))
  }

  /// Attach to `entry` if it produces `T`.
  fn try_join<T>(&self, key: &str, entry: &InFlightEntry) -> Option<Flight<T>>
  where
    T: Clone + Send + Sync + 'static,
  {
    let handle = entry.handle.downcast_ref::<FlightFuture<T>>()?;
    entry.state.interest.fetch_add(1, Ordering::AcqRel);
    debug!(key, flight = entry.state.id, "joined in-flight fetch");
    Some(Flight {
      handle: handle.clone(),
      interest: Interest {
        registry: Arc::clone(&self.inner),
        flight: Arc::clone(&entry.state),
      },
      joined: true,
    })
  }

  /// Create a flight, register it when `entries` is given, and spawn it.
  fn launch<T, F, Fut>(
    &self,
    key: &str,
    operation: F,
    forced_by: Option<u64>,
    entries: Option<MutexGuard<'_, HashMap<String, InFlightEntry>>>,
  ) -> Flight<T>
  where
    T: Clone + Send + Sync + 'static,
    F: FnOnce(FlightContext) -> Fut,
    Fut: Future<Output = FetchOutcome<T>> + Send + 'static,
  {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (token, registration) = CancelToken::new();
    let state = Arc::new(FlightState {
      id,
      key: key.to_string(),
      token: token.clone(),
      interest: AtomicUsize::new(1),
      finished: AtomicBool::new(false),
      started_at: Instant::now(),
      forced_by,
    });

    let (tx, rx) = oneshot::channel();
    // A dropped sender means the runtime went away mid-fetch.
    let handle: FlightFuture<T> = async move { rx.await.unwrap_or(FetchOutcome::Cancelled) }
      .boxed()
      .shared();

    // Registration and lookup happen under one lock, so two callers can never
    // both start a fetch for the same key.
    if let Some(mut entries) = entries {
      entries.insert(
        key.to_string(),
        InFlightEntry {
          state: Arc::clone(&state),
          handle: Box::new(handle.clone()),
        },
      );
    }
    self.inner.track(key);
    debug!(key, flight = id, forced = forced_by.is_some(), "starting fetch");

    let context = FlightContext {
      key: key.to_string(),
      id,
      token,
    };
    let operation = match catch_unwind(AssertUnwindSafe(|| operation(context))) {
      Ok(operation) => operation,
      Err(panic) => {
        state.finished.store(true, Ordering::Release);
        self.inner.finish(key, id);
        self.inner.untrack(key);
        resume_unwind(panic);
      }
    };

    let registry = Arc::clone(&self.inner);
    let driver_state = Arc::clone(&state);
    tokio::spawn(async move {
      let guarded = CancelToken::guard(operation, registration);
      let outcome = match AssertUnwindSafe(guarded).catch_unwind().await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_aborted)) => FetchOutcome::Cancelled,
        Err(panic) => FetchOutcome::Failed(LoadError::Panicked {
          key: driver_state.key.clone(),
          message: panic_message(panic.as_ref()),
        }),
      };
      driver_state.finished.store(true, Ordering::Release);
      registry.finish(&driver_state.key, driver_state.id);
      registry.untrack(&driver_state.key);
      if tx.send(outcome).is_err() {
        debug!(key = %driver_state.key, flight = driver_state.id, "fetch finished with nobody waiting");
      }
    });

    Flight {
      handle,
      interest: Interest {
        registry: Arc::clone(&self.inner),
        flight: state,
      },
      joined: false,
    }
  }

  /// Remove the entry for `key` whatever flight it belongs to.
  ///
  /// The fetch itself keeps running for the callers awaiting it.
  pub fn end(&self, key: &str) -> bool {
    self.inner.lock().remove(key).is_some()
  }

  /// Raise the token of the fetch registered for `key`, if any.
  pub fn cancel(&self, key: &str) -> bool {
    match self.inner.lock().get(key) {
      Some(entry) => {
        entry.state.token.cancel();
        true
      }
      None => false,
    }
  }

  /// Run `write` for flight `id` unless a later-started flight of `key`
  /// already committed.
  ///
  /// Results of one key are committed in start order: an older result is
  /// dropped only once a newer one is in, never because the newer fetch
  /// failed or was detached.
  pub fn commit<F: FnOnce()>(&self, key: &str, id: u64, write: F) -> bool {
    let mut writes = self.inner.writes();
    match writes.get_mut(key) {
      Some(mark) if mark.last_written > id => false,
      Some(mark) => {
        mark.last_written = id;
        write();
        true
      }
      None => {
        write();
        true
      }
    }
  }

  /// Whether `id` is still the registered fetch for `key`.
  pub fn is_current(&self, key: &str, id: u64) -> bool {
    self
      .inner
      .lock()
      .get(key)
      .is_some_and(|entry| entry.state.id == id)
  }

  pub fn contains(&self, key: &str) -> bool {
    self.inner.lock().contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.inner.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.lock().is_empty()
  }

  pub fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.inner.lock().keys().cloned().collect();
    keys.sort();
    keys
  }
}

impl std::fmt::Debug for InFlightRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("InFlightRegistry")
      .field("keys", &self.keys())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::AtomicU32;
  use std::time::Duration;

  fn slow_value(
    calls: Arc<AtomicU32>,
    value: u32,
  ) -> impl FnOnce(FlightContext) -> BoxFuture<'static, FetchOutcome<u32>> {
    move |_ctx| {
      calls.fetch_add(1, Ordering::SeqCst);
      async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        FetchOutcome::Value(value)
      }
      .boxed()
    }
  }

  fn value_of(outcome: FetchOutcome<u32>) -> Option<u32> {
    match outcome {
      FetchOutcome::Value(v) => Some(v),
      _ => None,
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_begin_deduplicates() {
    let registry = InFlightRegistry::new();
    let calls = Arc::new(AtomicU32::new(0));

    let first = registry.begin("k", slow_value(calls.clone(), 1));
    let second = registry.begin("k", slow_value(calls.clone(), 2));

    assert!(!first.joined());
    assert!(second.joined());
    assert_eq!(first.id(), second.id());
    assert_eq!(registry.len(), 1);

    let (a, b) = tokio::join!(first.wait(), second.wait());
    assert_eq!(value_of(a), Some(1));
    assert_eq!(value_of(b), Some(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Entry removed once the fetch finished
    assert!(registry.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_reaches_every_caller() {
    let registry = InFlightRegistry::new();
    let op = |ctx: FlightContext| async move {
      tokio::time::sleep(Duration::from_millis(10)).await;
      FetchOutcome::<u32>::Failed(LoadError::operation(&ctx.key, eyre!("down")))
    };

    let first = registry.begin("k", op);
    let second = registry.begin("k", op);
    let (a, b) = tokio::join!(first.wait(), second.wait());

    for outcome in [a, b] {
      match outcome {
        FetchOutcome::Failed(e) => assert_eq!(e.key(), "k"),
        other => panic!("expected failure, got {:?}", other),
      }
    }
    assert!(!registry.contains("k"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_replace_starts_new_fetch() {
    let registry = InFlightRegistry::new();
    let calls = Arc::new(AtomicU32::new(0));

    let old = registry.begin("k", slow_value(calls.clone(), 1));
    let new = registry.replace("k", slow_value(calls.clone(), 2));
    assert_ne!(old.id(), new.id());
    assert!(registry.is_current("k", new.id()));
    assert!(!registry.is_current("k", old.id()));

    let (a, b) = tokio::join!(old.wait(), new.wait());
    assert_eq!(value_of(a), Some(1));
    assert_eq!(value_of(b), Some(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(registry.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_forced_fetches_of_different_requesters_share() {
    let registry = InFlightRegistry::new();
    let calls = Arc::new(AtomicU32::new(0));

    let first = registry.refresh("k", 1, slow_value(calls.clone(), 1));
    let second = registry.refresh("k", 2, slow_value(calls.clone(), 2));
    assert!(!first.joined());
    assert!(second.joined());

    let (a, b) = tokio::join!(first.wait(), second.wait());
    assert_eq!(value_of(a), Some(1));
    assert_eq!(value_of(b), Some(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_forced_fetch_replaces_ordinary_and_own() {
    let registry = InFlightRegistry::new();
    let calls = Arc::new(AtomicU32::new(0));

    let ordinary = registry.begin("k", slow_value(calls.clone(), 1));
    let forced = registry.refresh("k", 7, slow_value(calls.clone(), 2));
    assert!(!forced.joined());
    let again = registry.refresh("k", 7, slow_value(calls.clone(), 3));
    assert!(!again.joined());
    assert!(registry.is_current("k", again.id()));

    let (a, b, c) = tokio::join!(ordinary.wait(), forced.wait(), again.wait());
    assert_eq!(value_of(a), Some(1));
    assert_eq!(value_of(b), Some(2));
    assert_eq!(value_of(c), Some(3));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_commit_follows_start_order() {
    let registry = InFlightRegistry::new();
    let calls = Arc::new(AtomicU32::new(0));
    let written = Arc::new(Mutex::new(Vec::new()));

    let older = registry.begin("k", slow_value(calls.clone(), 1));
    let newer = registry.replace("k", slow_value(calls.clone(), 2));

    // The newer result lands first, so the older one is refused
    assert!(registry.commit("k", newer.id(), || written.lock().unwrap().push("newer")));
    assert!(!registry.commit("k", older.id(), || written.lock().unwrap().push("older")));
    assert_eq!(*written.lock().unwrap(), vec!["newer"]);

    let _ = tokio::join!(older.wait(), newer.wait());
  }

  #[tokio::test(start_paused = true)]
  async fn test_older_result_commits_when_newer_never_does() {
    let registry = InFlightRegistry::new();
    let calls = Arc::new(AtomicU32::new(0));

    let older = registry.begin("k", slow_value(calls.clone(), 1));
    let newer = registry.replace("k", slow_value(calls.clone(), 2));
    drop(newer);

    assert!(registry.commit("k", older.id(), || ()));
    assert_eq!(value_of(older.wait().await), Some(1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_last_interest_cancels() {
    let registry = InFlightRegistry::new();
    let calls = Arc::new(AtomicU32::new(0));

    let flight = registry.begin("k", slow_value(calls, 1));
    let token = flight.token().clone();
    drop(flight);

    assert!(token.is_cancelled());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(registry.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_remaining_interest_keeps_fetch_alive() {
    let registry = InFlightRegistry::new();
    let calls = Arc::new(AtomicU32::new(0));

    let first = registry.begin("k", slow_value(calls.clone(), 1));
    let second = registry.begin("k", slow_value(calls.clone(), 2));
    let token = first.token().clone();
    drop(first);

    assert!(!token.is_cancelled());
    assert_eq!(value_of(second.wait().await), Some(1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancelled_entry_is_not_joined() {
    let registry = InFlightRegistry::new();
    let calls = Arc::new(AtomicU32::new(0));

    let first = registry.begin("k", slow_value(calls.clone(), 1));
    assert!(registry.cancel("k"));

    let second = registry.begin("k", slow_value(calls.clone(), 2));
    assert!(!second.joined());

    let (a, b) = tokio::join!(first.wait(), second.wait());
    assert!(matches!(a, FetchOutcome::Cancelled));
    assert_eq!(value_of(b), Some(2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_panicking_fetch_is_a_failure() {
    let registry = InFlightRegistry::new();
    let flight = registry.begin("k", |_ctx| async {
      tokio::time::sleep(Duration::from_millis(1)).await;
      if true {
        panic!("fetch exploded");
      }
      FetchOutcome::Value(0u32)
    });

    match flight.wait().await {
      FetchOutcome::Failed(LoadError::Panicked { message, .. }) => {
        assert_eq!(message, "fetch exploded");
      }
      other => panic!("expected panic failure, got {:?}", other),
    }
    assert!(registry.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_end_removes_unconditionally() {
    let registry = InFlightRegistry::new();
    let calls = Arc::new(AtomicU32::new(0));
    let flight = registry.begin("k", slow_value(calls, 1));

    assert!(registry.end("k"));
    assert!(!registry.end("k"));
    assert!(!registry.contains("k"));

    // The fetch still completes for its caller
    assert_eq!(value_of(flight.wait().await), Some(1));
  }
}
