// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Session teardown: waiting out both directional workers, closing the
//! upstream connection exactly-effectively-once, and aggregating every
//! observed error into one result.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::SessionError;
use crate::util::cancellation::CancellationListener;

/// Idempotent close handle for a session's upstream connection.
///
/// The first [UpstreamCloser::close] performs the real teardown: it cancels
/// the session-close token every worker races against, which unblocks any
/// worker inside a blocking read or write and makes it drop its upstream
/// half before reporting. Every later call is a safe no-op answering
/// [CloseOutcome::AlreadyClosed]; an already-closed upstream is a teardown
/// artifact, never a session fault.
#[derive(Debug)]
pub(crate) struct UpstreamCloser {
  session_close: CancellationToken,
  closed: AtomicBool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum CloseOutcome {
  Closed,
  AlreadyClosed,
}

impl UpstreamCloser {
  pub fn new() -> Self {
    Self {
      session_close: CancellationToken::new(),
      closed: AtomicBool::new(false),
    }
  }

  /// The token a worker must race its blocking I/O against.
  pub fn watch(&self) -> CancellationToken {
    self.session_close.clone()
  }

  pub fn close(&self) -> CloseOutcome {
    if self.closed.swap(true, Ordering::AcqRel) {
      CloseOutcome::AlreadyClosed
    } else {
      self.session_close.cancel();
      CloseOutcome::Closed
    }
  }
}

/// Error accumulator for one forwarding session.
///
/// A cancelled session surfaces the abort through the coordinator and
/// through every unblocked worker; only the first [SessionError::Cancelled]
/// is retained, since the repeats are artifacts of the teardown protocol.
/// Everything else is kept verbatim.
#[derive(Debug, Default)]
pub(crate) struct ErrorList {
  errors: Vec<SessionError>,
}

impl ErrorList {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, error: SessionError) {
    if matches!(error, SessionError::Cancelled)
      && self
        .errors
        .iter()
        .any(|e| matches!(e, SessionError::Cancelled))
    {
      return;
    }
    self.errors.push(error);
  }

  pub fn extend(&mut self, result: Result<(), SessionError>) {
    if let Err(error) = result {
      self.push(error);
    }
  }

  pub fn into_result(self) -> Result<(), MultiError> {
    if self.errors.is_empty() {
      Ok(())
    } else {
      Err(MultiError {
        errors: self.errors,
      })
    }
  }
}

/// Every error one forwarding session observed, as a single failure.
#[derive(Debug)]
pub struct MultiError {
  errors: Vec<SessionError>,
}

impl MultiError {
  pub fn errors(&self) -> &[SessionError] {
    &self.errors
  }
}

impl From<SessionError> for MultiError {
  fn from(error: SessionError) -> Self {
    Self {
      errors: vec![error],
    }
  }
}

impl fmt::Display for MultiError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.errors.as_slice() {
      [single] => fmt::Display::fmt(single, f),
      errors => {
        write!(f, "{} errors during forwarding session: ", errors.len())?;
        for (index, error) in errors.iter().enumerate() {
          if index > 0 {
            f.write_str("; ")?;
          }
          fmt::Display::fmt(error, f)?;
        }
        Ok(())
      }
    }
  }
}

impl std::error::Error for MultiError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    self
      .errors
      .first()
      .map(|e| e as &(dyn std::error::Error + 'static))
  }
}

/// Collects `expected` worker completions, honoring caller cancellation.
///
/// Cancellation closes the upstream exactly once and is recorded in the
/// aggregate; the loop then keeps draining the completion channel, because
/// the close is what unblocks the remaining workers and each of them still
/// reports. Once every signal is in, the upstream is closed again
/// unconditionally: on the natural-completion path this is the only close,
/// and on the cancellation path it is the safe no-op.
pub(crate) async fn wait_for_workers(
  cancel: &CancellationListener,
  closer: &UpstreamCloser,
  completions: &mut mpsc::Receiver<Result<(), SessionError>>,
  expected: usize,
) -> Result<(), MultiError> {
  let mut errors = ErrorList::new();
  let mut outstanding = expected;
  let mut cancellation_seen = false;
  while outstanding > 0 {
    tokio::select! {
      completion = completions.recv() => match completion {
        Some(result) => {
          outstanding -= 1;
          errors.extend(result);
        }
        None => {
          tracing::warn!(outstanding, "Completion channel closed early");
          break;
        }
      },
      _ = cancel.cancelled(), if !cancellation_seen => {
        cancellation_seen = true;
        tracing::debug!("Session cancelled by caller; closing upstream");
        closer.close();
        errors.push(SessionError::Cancelled);
      }
    }
  }
  closer.close();
  errors.into_result()
}
