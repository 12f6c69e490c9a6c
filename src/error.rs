//! Error types shared by everything that awaits a fetch.

use color_eyre::Report;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// A failed fetch, as seen by every caller awaiting it.
///
/// Cancellation is deliberately not represented here: a cancelled load
/// resolves to `Ok(None)`.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
  /// The fetch operation returned an error.
  #[error("fetch for `{key}` failed: {report}")]
  Operation { key: String, report: Arc<Report> },
  /// The task driving the fetch panicked.
  #[error("fetch for `{key}` panicked: {message}")]
  Panicked { key: String, message: String },
}

impl LoadError {
  pub(crate) fn operation(key: &str, report: Report) -> Self {
    Self::Operation {
      key: key.to_string(),
      report: Arc::new(report),
    }
  }

  /// Key of the fetch that failed.
  pub fn key(&self) -> &str {
    match self {
      Self::Operation { key, .. } | Self::Panicked { key, .. } => key,
    }
  }

  /// The underlying report, if the fetch itself returned one.
  pub fn report(&self) -> Option<&Report> {
    match self {
      Self::Operation { report, .. } => Some(&**report),
      Self::Panicked { .. } => None,
    }
  }
}

/// Result of a load: `Ok(None)` means the caller's interest was cancelled.
pub type LoadResult<T> = Result<Option<T>, LoadError>;

/// Run a caller-supplied side-effect callback, swallowing its failure.
///
/// Returns `true` if the callback completed without error or panic.
pub(crate) fn run_callback<F>(what: &str, key: &str, callback: F) -> bool
where
  F: FnOnce() -> color_eyre::Result<()>,
{
  match catch_unwind(AssertUnwindSafe(callback)) {
    Ok(Ok(())) => true,
    Ok(Err(e)) => {
      warn!(key, error = %e, "{} failed", what);
      false
    }
    Err(panic) => {
      let message = panic_message(panic.as_ref());
      warn!(key, panic = %message, "{} panicked", what);
      false
    }
  }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}
