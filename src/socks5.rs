//! SOCKS4/4a and SOCKS5 server handshakes
//!
//! Only CONNECT is served. BIND and UDP ASSOCIATE are refused with the
//! protocol's "command not supported" reply.

use crate::errors::{Error, ReplyError, Result};
use crate::sniff::{SOCKS4_VERSION, SOCKS5_VERSION};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS5_NO_AUTHENTICATION: u8 = 0x00;
const SOCKS5_NO_ACCEPTABLE_METHODS: u8 = 0xFF;

const SOCKS_CMD_CONNECT: u8 = 0x01;

const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

const SOCKS5_REP_SUCCESS: u8 = 0x00;

const SOCKS4_REPLY_VERSION: u8 = 0x00;
const SOCKS4_GRANTED: u8 = 0x5A;
const SOCKS4_REJECTED: u8 = 0x5B;

/// Longest user id / domain accepted in a SOCKS4 request
const SOCKS4_MAX_FIELD: usize = 255;

/// SOCKS target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
  /// IPv4 address
  Ipv4(Ipv4Addr, u16),
  /// IPv6 address
  Ipv6(Ipv6Addr, u16),
  /// Domain name
  Domain(String, u16),
}

impl TargetAddr {
  /// Get host (without port)
  pub fn host(&self) -> String {
    match self {
      TargetAddr::Ipv4(ip, _) => ip.to_string(),
      TargetAddr::Ipv6(ip, _) => ip.to_string(),
      TargetAddr::Domain(domain, _) => domain.clone(),
    }
  }

  /// Get port
  pub fn port(&self) -> u16 {
    match self {
      TargetAddr::Ipv4(_, port) | TargetAddr::Ipv6(_, port) | TargetAddr::Domain(_, port) => *port,
    }
  }
}

impl std::fmt::Display for TargetAddr {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      TargetAddr::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
      other => write!(f, "{}:{}", other.host(), other.port()),
    }
  }
}

/// Protocol version a handshake was made with, which decides the reply
/// format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
  /// SOCKS4 or SOCKS4a
  V4,
  /// SOCKS5
  V5,
}

/// A parsed CONNECT request, waiting for its reply.
///
/// The reply is only sent once the relay knows whether the upstream
/// connect worked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
  /// version the client spoke
  pub version: SocksVersion,
  /// destination
  pub target: TargetAddr,
}

impl SocksRequest {
  /// Tell the client the tunnel is up
  pub async fn reply_success<S>(&self, stream: &mut S) -> Result<()>
  where
    S: AsyncWrite + Unpin,
  {
    match self.version {
      SocksVersion::V5 => send_socks5_reply(stream, SOCKS5_REP_SUCCESS).await,
      SocksVersion::V4 => send_socks4_reply(stream, SOCKS4_GRANTED).await,
    }
  }

  /// Tell the client why the tunnel could not be established
  pub async fn reply_error<S>(&self, stream: &mut S, error: ReplyError) -> Result<()>
  where
    S: AsyncWrite + Unpin,
  {
    match self.version {
      SocksVersion::V5 => send_socks5_reply(stream, error.code()).await,
      SocksVersion::V4 => send_socks4_reply(stream, SOCKS4_REJECTED).await,
    }
  }
}

/// SOCKS server side handshake
pub struct Socks5Server;

impl Socks5Server {
  /// Run the handshake up to the CONNECT request.
  ///
  /// Unsupported commands and address types are answered here and surface
  /// as [`Error::Reply`].
  pub async fn handle_handshake<S>(stream: &mut S) -> Result<SocksRequest>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let version = stream.read_u8().await?;
    match version {
      SOCKS5_VERSION => Self::handle_socks5(stream).await,
      SOCKS4_VERSION => Self::handle_socks4(stream).await,
      _ => Err(Error::protocol(format!("Unsupported SOCKS version: {}", version))),
    }
  }

  async fn handle_socks5<S>(stream: &mut S) -> Result<SocksRequest>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let nmethods = stream.read_u8().await?;
    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;

    // no authentication is the only method offered
    let selected_method = if methods.contains(&SOCKS5_NO_AUTHENTICATION) {
      SOCKS5_NO_AUTHENTICATION
    } else {
      SOCKS5_NO_ACCEPTABLE_METHODS
    };
    stream.write_all(&[SOCKS5_VERSION, selected_method]).await?;
    stream.flush().await?;
    if selected_method == SOCKS5_NO_ACCEPTABLE_METHODS {
      return Err(Error::protocol("No acceptable SOCKS5 authentication method"));
    }

    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    let [version, cmd, _reserved, atyp] = buf;
    if version != SOCKS5_VERSION {
      return Err(Error::protocol(format!(
        "Invalid SOCKS version in request: {}",
        version
      )));
    }

    let target = match atyp {
      SOCKS5_ATYP_IPV4 => {
        let mut addr = [0u8; 4];
        stream.read_exact(&mut addr).await?;
        TargetAddr::Ipv4(Ipv4Addr::from(addr), stream.read_u16().await?)
      }
      SOCKS5_ATYP_IPV6 => {
        let mut addr = [0u8; 16];
        stream.read_exact(&mut addr).await?;
        TargetAddr::Ipv6(Ipv6Addr::from(addr), stream.read_u16().await?)
      }
      SOCKS5_ATYP_DOMAIN => {
        let len = stream.read_u8().await? as usize;
        let mut domain = vec![0u8; len];
        stream.read_exact(&mut domain).await?;
        let port = stream.read_u16().await?;
        let domain = String::from_utf8(domain)
          .map_err(|_| Error::protocol("Invalid domain name in SOCKS5 request"))?;
        TargetAddr::Domain(domain, port)
      }
      _ => {
        send_socks5_reply(stream, ReplyError::AddressTypeNotSupported.code()).await?;
        return Err(ReplyError::AddressTypeNotSupported.into());
      }
    };

    if cmd != SOCKS_CMD_CONNECT {
      tracing::debug!("[SOCKS5] refusing command {:#04x} for {}", cmd, target);
      send_socks5_reply(stream, ReplyError::CommandNotSupported.code()).await?;
      return Err(ReplyError::CommandNotSupported.into());
    }
    Ok(SocksRequest {
      version: SocksVersion::V5,
      target,
    })
  }

  async fn handle_socks4<S>(stream: &mut S) -> Result<SocksRequest>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let cmd = stream.read_u8().await?;
    let port = stream.read_u16().await?;
    let mut ip = [0u8; 4];
    stream.read_exact(&mut ip).await?;
    // user id is read and ignored
    read_nul_terminated(stream).await?;
    // 0.0.0.x with x != 0 marks SOCKS4a: the domain follows the user id
    let target = if ip[..3] == [0, 0, 0] && ip[3] != 0 {
      let domain = String::from_utf8(read_nul_terminated(stream).await?)
        .map_err(|_| Error::protocol("Invalid domain name in SOCKS4a request"))?;
      TargetAddr::Domain(domain, port)
    } else {
      TargetAddr::Ipv4(Ipv4Addr::from(ip), port)
    };
    if cmd != SOCKS_CMD_CONNECT {
      tracing::debug!("[SOCKS4] refusing command {:#04x} for {}", cmd, target);
      send_socks4_reply(stream, SOCKS4_REJECTED).await?;
      return Err(ReplyError::CommandNotSupported.into());
    }
    Ok(SocksRequest {
      version: SocksVersion::V4,
      target,
    })
  }
}

async fn read_nul_terminated<S>(stream: &mut S) -> Result<Vec<u8>>
where
  S: AsyncRead + Unpin,
{
  let mut field = Vec::new();
  loop {
    match stream.read_u8().await? {
      0 => return Ok(field),
      b if field.len() < SOCKS4_MAX_FIELD => field.push(b),
      _ => return Err(Error::protocol("SOCKS4 field too long")),
    }
  }
}

async fn send_socks5_reply<S>(stream: &mut S, reply_code: u8) -> Result<()>
where
  S: AsyncWrite + Unpin,
{
  // [VER, REP, RSV, ATYP, BND.ADDR, BND.PORT], bound to 0.0.0.0:0
  let response = [
    SOCKS5_VERSION,
    reply_code,
    0x00,
    SOCKS5_ATYP_IPV4,
    0x00,
    0x00,
    0x00,
    0x00,
    0x00,
    0x00,
  ];
  stream.write_all(&response).await?;
  stream.flush().await?;
  Ok(())
}

async fn send_socks4_reply<S>(stream: &mut S, reply_code: u8) -> Result<()>
where
  S: AsyncWrite + Unpin,
{
  let response = [SOCKS4_REPLY_VERSION, reply_code, 0, 0, 0, 0, 0, 0];
  stream.write_all(&response).await?;
  stream.flush().await?;
  Ok(())
}
