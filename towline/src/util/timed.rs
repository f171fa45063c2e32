// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Per-operation deadline enforcement for upstream I/O.
//!
//! Every read or write on a live upstream connection must carry a deadline so
//! that a stalled peer becomes a bounded failure instead of an indefinite
//! block. The deadline is armed when an operation first polls and cleared
//! when it completes, so it bounds single operations, never whole-connection
//! lifetimes: a slow-but-moving peer keeps its session.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

fn deadline_elapsed(operation: &'static str) -> io::Error {
  io::Error::new(
    io::ErrorKind::TimedOut,
    format!("{operation} deadline elapsed"),
  )
}

/// Bounds a future that performs one I/O step, mapping an elapsed limit to
/// [`io::ErrorKind::TimedOut`] like the wrapper types below.
pub async fn with_deadline<T, F>(limit: Duration, operation: &'static str, fut: F) -> io::Result<T>
where
  F: Future<Output = io::Result<T>>,
{
  match tokio::time::timeout(limit, fut).await {
    Ok(result) => result,
    Err(_) => Err(deadline_elapsed(operation)),
  }
}

pin_project_lite::pin_project! {
  /// [`AsyncRead`] adapter arming a fresh read deadline before each read.
  #[derive(Debug)]
  pub struct TimedReader<R> {
    #[pin]
    inner: R,
    limit: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
  }
}

impl<R> TimedReader<R> {
  pub fn new(inner: R, limit: Duration) -> Self {
    Self {
      inner,
      limit,
      deadline: None,
    }
  }
}

impl<R: AsyncRead> AsyncRead for TimedReader<R> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.project();
    if this.deadline.is_none() {
      *this.deadline = Some(Box::pin(tokio::time::sleep(*this.limit)));
    }
    if let Poll::Ready(result) = this.inner.poll_read(cx, buf) {
      *this.deadline = None;
      return Poll::Ready(result);
    }
    if let Some(deadline) = this.deadline.as_mut() {
      if deadline.as_mut().poll(cx).is_ready() {
        *this.deadline = None;
        return Poll::Ready(Err(deadline_elapsed("read")));
      }
    }
    Poll::Pending
  }
}

pin_project_lite::pin_project! {
  /// [`AsyncWrite`] adapter arming a fresh write deadline before each write.
  ///
  /// Flush and shutdown pass through undecorated; they carry no payload and
  /// complete with the final write on the transports this crate drives.
  #[derive(Debug)]
  pub struct TimedWriter<W> {
    #[pin]
    inner: W,
    limit: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
  }
}

impl<W> TimedWriter<W> {
  pub fn new(inner: W, limit: Duration) -> Self {
    Self {
      inner,
      limit,
      deadline: None,
    }
  }
}

impl<W: AsyncWrite> AsyncWrite for TimedWriter<W> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    let this = self.project();
    if this.deadline.is_none() {
      *this.deadline = Some(Box::pin(tokio::time::sleep(*this.limit)));
    }
    if let Poll::Ready(result) = this.inner.poll_write(cx, buf) {
      *this.deadline = None;
      return Poll::Ready(result);
    }
    if let Some(deadline) = this.deadline.as_mut() {
      if deadline.as_mut().poll(cx).is_ready() {
        *this.deadline = None;
        return Poll::Ready(Err(deadline_elapsed("write")));
      }
    }
    Poll::Pending
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.project().inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.project().inner.poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use std::io;
  use std::time::Duration;

  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::{with_deadline, TimedReader, TimedWriter};

  #[tokio::test]
  async fn stalled_read_fails_with_timed_out() {
    let (near, _far) = tokio::io::duplex(64);
    let mut reader = TimedReader::new(near, Duration::from_millis(50));
    let mut buf = [0u8; 8];
    let error = reader
      .read(&mut buf)
      .await
      .expect_err("A read with no incoming data must hit its deadline");
    assert_eq!(error.kind(), io::ErrorKind::TimedOut);
  }

  #[tokio::test]
  async fn deadline_rearms_per_read() {
    let (near, mut far) = tokio::io::duplex(64);
    let mut reader = TimedReader::new(near, Duration::from_millis(200));
    let mut buf = [0u8; 8];
    // Three reads, each delivered after a delay shorter than the limit but
    // summing beyond it; only a per-operation deadline lets all three pass.
    let writer = tokio::spawn(async move {
      for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        far.write_all(b"x").await.unwrap();
      }
      far
    });
    for _ in 0..3 {
      let n = reader.read(&mut buf).await.unwrap();
      assert_eq!(n, 1);
    }
    drop(writer.await.unwrap());
  }

  #[tokio::test]
  async fn stalled_write_fails_with_timed_out() {
    // Fill the duplex until backpressure, with nobody draining the far end.
    let (near, _far) = tokio::io::duplex(16);
    let mut writer = TimedWriter::new(near, Duration::from_millis(50));
    let payload = [0u8; 64];
    let error = writer
      .write_all(&payload)
      .await
      .expect_err("A write against a full channel must hit its deadline");
    assert_eq!(error.kind(), io::ErrorKind::TimedOut);
  }

  #[tokio::test]
  async fn one_shot_deadline_maps_to_timed_out() {
    let error = with_deadline(Duration::from_millis(20), "connect", async {
      tokio::time::sleep(Duration::from_secs(5)).await;
      Ok(())
    })
    .await
    .expect_err("The wrapped future outlives the limit");
    assert_eq!(error.kind(), io::ErrorKind::TimedOut);
  }
}
