//! First-byte protocol classification for the unified port.
use crate::errors::Result;
use crate::socket::PrefixedStream;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

/// TLS record type of a handshake message
pub const TLS_HANDSHAKE: u8 = 0x16;
/// Major protocol version byte shared by SSL 3.0 and every TLS version
pub const TLS_MAJOR_VERSION: u8 = 0x03;
/// SOCKS4 / SOCKS4a version byte
pub const SOCKS4_VERSION: u8 = 0x04;
/// SOCKS5 version byte
pub const SOCKS5_VERSION: u8 = 0x05;

const HTTP_METHODS: [&[u8]; 9] = [
  b"GET ",
  b"POST ",
  b"PUT ",
  b"DELETE ",
  b"HEAD ",
  b"OPTIONS ",
  b"CONNECT ",
  b"PATCH ",
  b"TRACE ",
];

/// Result of looking at the buffered prefix of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
  /// Not enough bytes to decide
  NeedMore,
  /// HTTP/1.x request line, `connect` set for `CONNECT`
  Http {
    /// the request method is `CONNECT`
    connect: bool,
  },
  /// TLS ClientHello record
  Tls,
  /// SOCKS4 or SOCKS5 greeting
  Socks,
  /// Nothing this port speaks
  Invalid,
}

/// Classify `buf` without consuming it.
pub fn classify(buf: &[u8]) -> Verdict {
  let Some(&first) = buf.first() else {
    return Verdict::NeedMore;
  };
  match first {
    TLS_HANDSHAKE => match buf.get(1) {
      None => Verdict::NeedMore,
      Some(&TLS_MAJOR_VERSION) => Verdict::Tls,
      Some(_) => Verdict::Invalid,
    },
    SOCKS4_VERSION | SOCKS5_VERSION => Verdict::Socks,
    _ => classify_http(buf),
  }
}

fn classify_http(buf: &[u8]) -> Verdict {
  let mut partial = false;
  for method in HTTP_METHODS {
    if buf.starts_with(method) {
      return Verdict::Http {
        connect: method == b"CONNECT ",
      };
    }
    if method.starts_with(buf) {
      partial = true;
    }
  }
  if partial {
    Verdict::NeedMore
  } else {
    Verdict::Invalid
  }
}

/// Read from `stream` until [`classify`] reaches a verdict.
///
/// Every byte read is handed back in the returned [`PrefixedStream`], so the
/// chain that takes over starts from the first byte of the connection.
/// Returns `None` when the peer closes before a verdict.
pub async fn sniff<S>(mut stream: S) -> Result<Option<(Verdict, PrefixedStream<S>)>>
where
  S: AsyncRead + Unpin,
{
  let mut buf = BytesMut::with_capacity(512);
  loop {
    let verdict = classify(&buf);
    if verdict != Verdict::NeedMore {
      tracing::debug!("sniffed {:?} after {} bytes", verdict, buf.len());
      return Ok(Some((verdict, PrefixedStream::new(buf.freeze(), stream))));
    }
    if stream.read_buf(&mut buf).await? == 0 {
      tracing::debug!("peer closed after {} bytes without a verdict", buf.len());
      return Ok(None);
    }
  }
}
