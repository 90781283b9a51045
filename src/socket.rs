use bytes::{Buf, Bytes};
use std::io::Error;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Any bidirectional byte stream a connection chain can run over.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Type-erased stream handed between the dispatcher, tunnels and HTTP sessions.
pub type BoxedIo = Box<dyn Io>;

/// Upstream socket opened by the [`Connector`](crate::Connector)
#[derive(Debug)]
pub struct Socket {
  inner: MaybeTlsStream,
  peer: SocketAddr,
  read_timeout: Option<Duration>,
}

impl Socket {
  pub(crate) fn new(
    maybe_tls_stream: MaybeTlsStream,
    peer: SocketAddr,
    read_timeout: Option<Duration>,
  ) -> Self {
    Self {
      inner: maybe_tls_stream,
      peer,
      read_timeout,
    }
  }
  pub(crate) async fn tls<F, Fut>(self, func: F) -> Result<Self, Error>
  where
    F: FnOnce(TcpStream) -> Fut,
    Fut: std::future::Future<Output = Result<TlsStream<TcpStream>, Error>>,
  {
    match self.inner {
      MaybeTlsStream::Tcp(t) => Ok(Self {
        inner: MaybeTlsStream::Tls(Box::new(func(t).await?)),
        peer: self.peer,
        read_timeout: self.read_timeout,
      }),
      MaybeTlsStream::Tls(t) => Ok(Self {
        inner: MaybeTlsStream::Tls(t),
        peer: self.peer,
        read_timeout: self.read_timeout,
      }),
    }
  }
  /// Remote address of the upstream
  pub fn peer_addr(&self) -> SocketAddr {
    self.peer
  }
  /// Whether the upstream leg is encrypted
  pub fn is_tls(&self) -> bool {
    matches!(self.inner, MaybeTlsStream::Tls(_))
  }
  /// Read timeout applied by callers while waiting on the upstream
  pub fn read_timeout(&self) -> Option<Duration> {
    self.read_timeout
  }
}

/// A plain TCP stream or a client-side TLS stream over it
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS
  Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Socket {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl AsyncWrite for Socket {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}

/// A stream that yields `prefix` before reading from `inner`.
///
/// Bytes consumed while classifying a connection are replayed through this
/// wrapper so the chain that takes over sees the stream from its first byte.
#[derive(Debug)]
pub struct PrefixedStream<S> {
  prefix: Bytes,
  inner: S,
}

impl<S> PrefixedStream<S> {
  /// Wrap `inner`, replaying `prefix` first
  pub fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
    Self {
      prefix: prefix.into(),
      inner,
    }
  }
  /// Bytes still waiting to be replayed
  pub fn prefix(&self) -> &[u8] {
    &self.prefix
  }
  /// Discard the wrapper. Any unreplayed prefix is lost.
  pub fn into_inner(self) -> S {
    self.inner
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    if !self.prefix.is_empty() {
      let n = std::cmp::min(self.prefix.len(), buf.remaining());
      buf.put_slice(&self.prefix[..n]);
      self.prefix.advance(n);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}
