//! Debounce and throttle primitives for high-churn callers such as
//! incremental search. Independent of the cache.

use color_eyre::Result;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::debug;

use crate::error::run_callback;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publishes a value only once input has been quiet for `delay`.
///
/// Every `push` restarts the quiet period; superseded values are discarded
/// without ever being published.
pub struct Debouncer<T> {
  delay: Duration,
  output: Arc<watch::Sender<Option<T>>>,
  pending: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + Sync + 'static> Debouncer<T> {
  pub fn new(delay: Duration) -> Self {
    let (output, _) = watch::channel(None);
    Self {
      delay,
      output: Arc::new(output),
      pending: Mutex::new(None),
    }
  }

  /// Offer a new input value.
  pub fn push(&self, value: T) {
    let output = Arc::clone(&self.output);
    let delay = self.delay;
    let task = tokio::spawn(async move {
      sleep(delay).await;
      output.send_replace(Some(value));
    });

    if let Some(previous) = lock(&self.pending).replace(task) {
      previous.abort();
    }
  }

  /// Discard the pending value, if any.
  pub fn cancel(&self) {
    if let Some(task) = lock(&self.pending).take() {
      task.abort();
    }
  }

  /// Last published value.
  pub fn value(&self) -> Option<T> {
    self.output.borrow().clone()
  }

  /// Observe published values.
  pub fn subscribe(&self) -> watch::Receiver<Option<T>> {
    self.output.subscribe()
  }
}

impl<T> Drop for Debouncer<T> {
  fn drop(&mut self) {
    if let Some(task) = lock(&self.pending).take() {
      task.abort();
    }
  }
}

type ThrottledFn<A> = Box<dyn Fn(A) -> Result<()> + Send + Sync>;

struct ThrottleState<A> {
  last_fired: Option<Instant>,
  /// Latest argument of calls waiting for the interval boundary
  trailing: Option<A>,
  scheduled: Option<JoinHandle<()>>,
}

struct ThrottleInner<A> {
  min_interval: Duration,
  call: ThrottledFn<A>,
  state: Mutex<ThrottleState<A>>,
}

impl<A> ThrottleInner<A> {
  fn invoke(&self, arg: A) {
    run_callback("throttled call", "throttle", || (self.call)(arg));
  }
}

/// Runs a callback at most once per `min_interval`.
///
/// A call outside the interval fires immediately. Calls inside it are
/// coalesced into one trailing call at the interval boundary, carrying the
/// most recent argument.
pub struct Throttle<A> {
  inner: Arc<ThrottleInner<A>>,
}

impl<A: Send + 'static> Throttle<A> {
  pub fn new<F>(min_interval: Duration, call: F) -> Self
  where
    F: Fn(A) -> Result<()> + Send + Sync + 'static,
  {
    Self {
      inner: Arc::new(ThrottleInner {
        min_interval,
        call: Box::new(call),
        state: Mutex::new(ThrottleState {
          last_fired: None,
          trailing: None,
          scheduled: None,
        }),
      }),
    }
  }

  pub fn call(&self, arg: A) {
    let now = Instant::now();
    let mut state = lock(&self.inner.state);

    let within_interval = state
      .last_fired
      .is_some_and(|last| now.saturating_duration_since(last) < self.inner.min_interval);

    if !within_interval && state.trailing.is_none() {
      state.last_fired = Some(now);
      drop(state);
      self.inner.invoke(arg);
      return;
    }

    let already_scheduled = state.trailing.replace(arg).is_some();
    if already_scheduled {
      debug!("coalesced throttled call");
      return;
    }

    let inner = Arc::clone(&self.inner);
    let mut deadline = state.last_fired.map_or(now, |last| last + inner.min_interval);
    state.scheduled = Some(tokio::spawn(async move {
      loop {
        sleep_until(deadline).await;
        let arg = {
          let mut state = lock(&inner.state);
          let now = Instant::now();
          // A leading call may have fired while we slept.
          if let Some(last) = state.last_fired {
            if now.saturating_duration_since(last) < inner.min_interval {
              deadline = last + inner.min_interval;
              continue;
            }
          }
          state.last_fired = Some(now);
          state.scheduled = None;
          state.trailing.take()
        };
        if let Some(arg) = arg {
          inner.invoke(arg);
        }
        break;
      }
    }));
  }

  /// Drop a pending trailing call.
  pub fn cancel(&self) {
    let mut state = lock(&self.inner.state);
    state.trailing = None;
    if let Some(task) = state.scheduled.take() {
      task.abort();
    }
  }

  /// Whether a trailing call is waiting for the interval boundary.
  pub fn is_pending(&self) -> bool {
    lock(&self.inner.state).trailing.is_some()
  }
}

impl<A> Drop for Throttle<A> {
  fn drop(&mut self) {
    if let Some(task) = lock(&self.inner.state).scheduled.take() {
      task.abort();
    }
  }
}
