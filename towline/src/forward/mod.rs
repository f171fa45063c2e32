// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The forwarding engine: relays bytes between a downstream tunnel channel
//! and a concrete upstream TCP or UDP endpoint until either side closes,
//! a deadline fires, or the caller cancels the session.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing_futures::Instrument;

use crate::util::buffer_pool::BufferPool;
use crate::util::cancellation::CancellationListener;
use crate::util::framed;
use crate::util::timed::{with_deadline, TimedReader, TimedWriter};

mod completion;

pub use self::completion::MultiError;
use self::completion::UpstreamCloser;

/// Element size of the stream-copy buffer pool.
const STREAM_BUFFER_CAPACITY: usize = 8 * 1024;
/// Element size of the datagram buffer pool; one maximum UDP payload.
const DATAGRAM_BUFFER_CAPACITY: usize = u16::MAX as usize;
/// Directional workers per forwarding session.
const WORKERS_PER_SESSION: usize = 2;

/// The downstream side of a forwarding session: an ordered byte stream in
/// both directions.
///
/// The forwarder reads and writes the handle, and propagates half-close onto
/// its write side when the opposite direction drains, but never owns its
/// lifecycle; closing the channel remains the caller's responsibility, as
/// does bounding it — no deadline is imposed on downstream operations.
pub trait Downstream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Downstream for T {}

#[derive(thiserror::Error, Debug)]
pub enum OptionsError {
  #[error("{field} must be a positive duration; every upstream operation carries a deadline")]
  NonPositiveTimeout { field: &'static str },
}

/// Immutable configuration for a [Forwarder].
///
/// Every timeout must be positive: a zero duration would mean "no
/// owner-imposed deadline", which this core does not support — deadlines are
/// what bound resource lifetime when a peer stalls.
#[derive(Debug, Clone)]
pub struct Options {
  pub connect_timeout: Duration,
  pub read_timeout: Duration,
  pub write_timeout: Duration,
  pub upstream_tcp: String,
  pub upstream_udp: String,
}

impl Options {
  fn validate(&self) -> Result<(), OptionsError> {
    for (field, value) in [
      ("connect_timeout", self.connect_timeout),
      ("read_timeout", self.read_timeout),
      ("write_timeout", self.write_timeout),
    ] {
      if value.is_zero() {
        return Err(OptionsError::NonPositiveTimeout { field });
      }
    }
    Ok(())
  }
}

/// One error observed by a forwarding session.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
  #[error("Failed to reach upstream {address}: {source}")]
  Dial {
    address: String,
    #[source]
    source: io::Error,
  },
  #[error("Transport failure: {0}")]
  Transport(#[from] io::Error),
  #[error("Framing violation on the downstream channel: {0}")]
  Framing(#[from] framed::ReadError),
  #[error("Session cancelled by caller")]
  Cancelled,
}

impl From<framed::WriteError> for SessionError {
  fn from(error: framed::WriteError) -> Self {
    // An encode failure is a downstream write failure, not a framing
    // violation; only the decode side can observe a malformed record.
    let framed::WriteError::UnexpectedEnd(inner) = error;
    SessionError::Transport(inner)
  }
}

/// Relays bytes between downstream tunnel channels and the configured
/// upstream endpoints.
///
/// Stateless across sessions apart from its buffer pools; clones share the
/// pools, and one instance may serve any number of concurrent sessions.
#[derive(Debug, Clone)]
pub struct Forwarder {
  options: Options,
  copy_pool: BufferPool,
  datagram_pool: BufferPool,
}

impl Forwarder {
  pub fn new(options: Options) -> Result<Self, OptionsError> {
    options.validate()?;
    Ok(Self {
      options,
      copy_pool: BufferPool::new(STREAM_BUFFER_CAPACITY),
      datagram_pool: BufferPool::new(DATAGRAM_BUFFER_CAPACITY),
    })
  }

  /// Relays the downstream channel against the configured upstream TCP
  /// endpoint until both directions finish or `cancel` fires.
  ///
  /// Returns `Ok(())` only when both directions reached clean end-of-stream;
  /// otherwise every observed error is aggregated into the returned
  /// [MultiError]. A dial failure reports immediately, with no workers
  /// started. The upstream connection is released by the time this returns,
  /// on every path.
  pub async fn forward_tcp<D>(
    &self,
    cancel: CancellationListener,
    downstream: D,
  ) -> Result<(), MultiError>
  where
    D: Downstream + 'static,
  {
    let span = tracing::span!(
      tracing::Level::DEBUG,
      "forward_tcp",
      upstream = %self.options.upstream_tcp,
    );
    async move {
      let upstream = self.dial_tcp().await?;
      let (upstream_read, upstream_write) = upstream.into_split();
      let upstream_read = TimedReader::new(upstream_read, self.options.read_timeout);
      let upstream_write = TimedWriter::new(upstream_write, self.options.write_timeout);
      let (downstream_read, downstream_write) = tokio::io::split(downstream);

      let closer = UpstreamCloser::new();
      let (completions, mut collected) = mpsc::channel(WORKERS_PER_SESSION);
      spawn_worker(
        "downstream_to_upstream",
        &closer,
        completions.clone(),
        stream_copy(self.copy_pool.clone(), downstream_read, upstream_write),
      );
      spawn_worker(
        "upstream_to_downstream",
        &closer,
        completions,
        stream_copy(self.copy_pool.clone(), upstream_read, downstream_write),
      );

      completion::wait_for_workers(&cancel, &closer, &mut collected, WORKERS_PER_SESSION).await
    }
    .instrument(span)
    .await
  }

  /// Relays datagram traffic between the downstream channel and the
  /// configured upstream UDP endpoint.
  ///
  /// Datagram boundaries survive the byte-oriented downstream channel via
  /// 2-byte length-prefixed records: each upstream datagram becomes one
  /// record downstream, and each decoded record becomes one upstream
  /// datagram. A record the relay cannot decode ends the session — a
  /// corrupted length-prefixed stream cannot be resynchronized.
  pub async fn forward_udp<D>(
    &self,
    cancel: CancellationListener,
    downstream: D,
  ) -> Result<(), MultiError>
  where
    D: Downstream + 'static,
  {
    let span = tracing::span!(
      tracing::Level::DEBUG,
      "forward_udp",
      upstream = %self.options.upstream_udp,
    );
    async move {
      let upstream = Arc::new(self.dial_udp().await?);
      let (downstream_read, downstream_write) = tokio::io::split(downstream);

      let closer = UpstreamCloser::new();
      let (completions, mut collected) = mpsc::channel(WORKERS_PER_SESSION);
      spawn_worker(
        "upstream_to_downstream",
        &closer,
        completions.clone(),
        relay_upstream_datagrams(
          self.datagram_pool.clone(),
          Arc::clone(&upstream),
          self.options.read_timeout,
          downstream_write,
        ),
      );
      spawn_worker(
        "downstream_to_upstream",
        &closer,
        completions,
        relay_downstream_records(
          self.datagram_pool.clone(),
          upstream,
          self.options.write_timeout,
          downstream_read,
        ),
      );

      completion::wait_for_workers(&cancel, &closer, &mut collected, WORKERS_PER_SESSION).await
    }
    .instrument(span)
    .await
  }

  async fn dial_tcp(&self) -> Result<TcpStream, SessionError> {
    let address = self.options.upstream_tcp.as_str();
    tracing::debug!("Dialing upstream over TCP");
    with_deadline(
      self.options.connect_timeout,
      "connect",
      TcpStream::connect(address),
    )
    .await
    .map_err(|source| SessionError::Dial {
      address: address.to_owned(),
      source,
    })
  }

  async fn dial_udp(&self) -> Result<UdpSocket, SessionError> {
    let address = self.options.upstream_udp.as_str();
    tracing::debug!("Dialing upstream over UDP");
    with_deadline(self.options.connect_timeout, "connect", async {
      let target = lookup_host(address).await?.next().ok_or_else(|| {
        io::Error::new(
          io::ErrorKind::NotFound,
          "address resolved to no socket addresses",
        )
      })?;
      let bind_address: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
      } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
      };
      let socket = UdpSocket::bind(bind_address).await?;
      socket.connect(target).await?;
      Ok(socket)
    })
    .await
    .map_err(|source| SessionError::Dial {
      address: address.to_owned(),
      source,
    })
  }
}

/// Runs one directional worker as a task racing its work against the
/// session-close token, and reports the outcome on the completion channel.
///
/// The channel's capacity covers every worker in the session, so reporting
/// never blocks. Losing the race drops the in-flight I/O future — and with
/// it the worker's half of the upstream connection — before the report is
/// sent, which is what makes the upstream observably closed once the
/// coordinator has collected every signal.
fn spawn_worker<F>(
  direction: &'static str,
  closer: &UpstreamCloser,
  completions: mpsc::Sender<Result<(), SessionError>>,
  work: F,
) where
  F: Future<Output = Result<(), SessionError>> + Send + 'static,
{
  let session_close = closer.watch();
  let span = tracing::span!(tracing::Level::DEBUG, "forward_worker", direction);
  tokio::spawn(
    async move {
      let result = tokio::select! {
        result = work => result,
        _ = session_close.cancelled() => Err(SessionError::Cancelled),
      };
      if let Err(error) = &result {
        tracing::debug!(error = %error, "Worker terminated with error");
      }
      let _ = completions.send(result).await;
    }
    .instrument(span),
  );
}

/// The byte pump: copies `src` into `dst` through a pooled buffer until the
/// source reaches end-of-stream or an I/O error occurs.
///
/// Clean end-of-stream shuts down the destination's write side, so a
/// half-close travels the relay and the opposite direction can drain and
/// finish; without that, a relayed session could only ever end by deadline.
#[tracing::instrument(level = "trace", err, skip(pool, src, dst))]
async fn stream_copy<R, W>(pool: BufferPool, mut src: R, mut dst: W) -> Result<(), SessionError>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buffer = pool.get();
  let mut copied: u64 = 0;
  loop {
    let n = src.read(&mut buffer[..]).await?;
    if n == 0 {
      dst.shutdown().await?;
      tracing::trace!(copied, "Source reached end of stream");
      return Ok(());
    }
    dst.write_all(&buffer[..n]).await?;
    copied += n as u64;
  }
}

/// UDP relay, upstream to downstream: each received datagram becomes one
/// length-prefixed record on the downstream channel. A read deadline is
/// armed before every receive.
async fn relay_upstream_datagrams<W>(
  pool: BufferPool,
  upstream: Arc<UdpSocket>,
  read_limit: Duration,
  mut downstream: W,
) -> Result<(), SessionError>
where
  W: AsyncWrite + Unpin,
{
  let mut buffer = pool.get();
  loop {
    let n = with_deadline(read_limit, "datagram receive", upstream.recv(&mut buffer[..])).await?;
    framed::write_frame(&mut downstream, &buffer[..n]).await?;
  }
}

/// UDP relay, downstream to upstream: each decoded record is sent as one
/// datagram. A write deadline is armed before every send; downstream
/// end-of-stream on a record boundary ends the worker cleanly.
async fn relay_downstream_records<R>(
  pool: BufferPool,
  upstream: Arc<UdpSocket>,
  write_limit: Duration,
  mut downstream: R,
) -> Result<(), SessionError>
where
  R: AsyncRead + Unpin,
{
  let mut buffer = pool.get();
  loop {
    let length = match framed::read_frame(&mut downstream, &mut buffer[..]).await? {
      Some(length) => length,
      None => {
        tracing::trace!("Downstream reached end of stream");
        return Ok(());
      }
    };
    with_deadline(write_limit, "datagram send", upstream.send(&buffer[..length])).await?;
  }
}
