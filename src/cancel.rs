//! Cooperative cancellation passed to every fetch operation.

use futures::future::{AbortHandle, AbortRegistration, Abortable};
use std::future::Future;

/// Signal telling a fetch operation to stop producing a result.
///
/// The token is handed to the fetch operation so it can check
/// `is_cancelled()` between steps. Independently of that, the operation is
/// driven through [`CancelToken::guard`], so once the token is raised the
/// operation is dropped at its next suspension point.
#[derive(Debug, Clone)]
pub struct CancelToken {
  handle: AbortHandle,
}

impl CancelToken {
  /// Create a token and the registration used to make a future abortable.
  pub fn new() -> (Self, AbortRegistration) {
    let (handle, registration) = AbortHandle::new_pair();
    (Self { handle }, registration)
  }

  /// Raise the token. Idempotent.
  pub fn cancel(&self) {
    self.handle.abort();
  }

  pub fn is_cancelled(&self) -> bool {
    self.handle.is_aborted()
  }

  /// Wrap `future` so it stops when the token paired with `registration` is raised.
  pub fn guard<F: Future>(future: F, registration: AbortRegistration) -> Abortable<F> {
    Abortable::new(future, registration)
  }
}
