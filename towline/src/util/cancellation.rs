// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A [CancellationToken] that cannot be triggered by its recipient
///
/// A forwarding session receives one of these in place of the caller's
/// cancellable token: the session can observe and derive from the
/// cancellation, but only the caller can fire it. Child tokens produced
/// through [CancellationListener::child_token] allow sub-cancellation.
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct CancellationListener {
  token: CancellationToken,
}

impl CancellationListener {
  /// Derives a token cancelled when (and only when) the parent is.
  pub fn child_token(&self) -> CancellationToken {
    self.token.child_token()
  }

  /// Derives a listener scoped under this one.
  pub fn child_listener(&self) -> CancellationListener {
    Self::from(self.child_token())
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}

impl From<CancellationToken> for CancellationListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

#[cfg(test)]
mod tests {
  use tokio_util::sync::CancellationToken;

  use super::CancellationListener;

  #[tokio::test]
  async fn listener_observes_caller_cancellation() {
    let caller = CancellationToken::new();
    let listener = CancellationListener::from(caller.clone());
    let child = listener.child_listener();
    assert!(!listener.is_cancelled());
    caller.cancel();
    listener.cancelled().await;
    child.cancelled().await;
    assert!(listener.is_cancelled());
  }
}
