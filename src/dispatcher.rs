//! Per-connection protocol dispatch
//!
//! Every accepted socket is sniffed once, gets exactly one [`Chain`]
//! installed for the detected protocol, and runs that chain to completion.
//! The only later re-sniff is the one the interception tunnel performs on
//! the bytes inside a CONNECT tunnel.

use crate::errors::{Error, Result};
use crate::proxy::{ProxyContext, ProxyMode};
use crate::record::LogFilter;
use crate::relay;
use crate::session::{HttpSession, SessionOutcome};
use crate::sniff::{sniff, Verdict};
use crate::socket::BoxedIo;
use crate::socks5::Socks5Server;
use crate::tls;
use crate::tunnel::InterceptTunnel;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

/// Protocol negotiated on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
  /// not sniffed yet
  Unknown,
  /// HTTP/1.x in the clear
  PlainHttp,
  /// TLS straight to the listening port
  Tls,
  /// HTTP CONNECT tunnel request
  Connect,
  /// SOCKS4/4a/5
  Socks,
}

/// Handler chain installed for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
  /// HTTP decoding
  Plain,
  /// TLS termination, then HTTP decoding
  Tls,
  /// HTTP decoding of the CONNECT request, then a tunnel
  Connect,
  /// SOCKS handshake, then a relay
  Socks,
}

impl Chain {
  /// Chain for a sniff verdict; `None` for verdicts nothing handles.
  pub fn from_verdict(verdict: Verdict) -> Option<Chain> {
    match verdict {
      Verdict::Http { connect: false } => Some(Chain::Plain),
      Verdict::Http { connect: true } => Some(Chain::Connect),
      Verdict::Tls => Some(Chain::Tls),
      Verdict::Socks => Some(Chain::Socks),
      Verdict::NeedMore | Verdict::Invalid => None,
    }
  }

  fn protocol(self) -> Protocol {
    match self {
      Chain::Plain => Protocol::PlainHttp,
      Chain::Tls => Protocol::Tls,
      Chain::Connect => Protocol::Connect,
      Chain::Socks => Protocol::Socks,
    }
  }
}

/// Dispatch state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
  /// accepted, nothing read
  Idle,
  /// reading the first bytes
  Sniffing,
  /// chain selected
  Installed(Chain),
  /// chain running
  Active(Chain),
  /// done
  Closed,
}

/// State of one accepted connection, handed to every chain handler.
pub struct ConnectionContext {
  id: u64,
  peer: SocketAddr,
  protocol: Protocol,
  state: DispatchState,
  upstream: Option<String>,
  proxy: Arc<ProxyContext>,
}

impl std::fmt::Debug for ConnectionContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnectionContext")
      .field("id", &self.id)
      .field("peer", &self.peer)
      .field("protocol", &self.protocol)
      .field("state", &self.state)
      .field("upstream", &self.upstream)
      .finish()
  }
}

impl ConnectionContext {
  pub(crate) fn new(proxy: Arc<ProxyContext>, peer: SocketAddr) -> Self {
    Self {
      id: proxy.next_connection_id(),
      peer,
      protocol: Protocol::Unknown,
      state: DispatchState::Idle,
      upstream: None,
      proxy,
    }
  }

  /// Connection id, unique per instance
  pub fn id(&self) -> u64 {
    self.id
  }
  /// Client address
  pub fn peer(&self) -> SocketAddr {
    self.peer
  }
  /// Negotiated protocol
  pub fn protocol(&self) -> Protocol {
    self.protocol
  }
  /// Dispatch state
  pub fn state(&self) -> DispatchState {
    self.state
  }
  /// `host:port` of the upstream once a tunnel or forward connection exists
  pub fn upstream(&self) -> Option<&str> {
    self.upstream.as_deref()
  }
  /// Mode of the owning instance
  pub fn mode(&self) -> &ProxyMode {
    &self.proxy.mode
  }
  /// Exchange log of the owning instance
  pub fn log(&self) -> &LogFilter {
    &self.proxy.log
  }

  pub(crate) fn proxy(&self) -> &Arc<ProxyContext> {
    &self.proxy
  }

  pub(crate) fn set_upstream(&mut self, upstream: String) {
    self.upstream = Some(upstream);
  }

  pub(crate) fn begin_sniff(&mut self) -> Result<()> {
    if self.state != DispatchState::Idle {
      return Err(Error::protocol(format!(
        "connection {} cannot sniff in state {:?}",
        self.id, self.state
      )));
    }
    self.state = DispatchState::Sniffing;
    Ok(())
  }

  /// Select the chain. Only one install per connection is allowed.
  pub(crate) fn install(&mut self, chain: Chain) -> Result<()> {
    if self.state != DispatchState::Sniffing {
      return Err(Error::protocol(format!(
        "connection {} already has a chain ({:?})",
        self.id, self.state
      )));
    }
    self.protocol = chain.protocol();
    self.state = DispatchState::Installed(chain);
    Ok(())
  }

  pub(crate) fn activate(&mut self) -> Result<Chain> {
    match self.state {
      DispatchState::Installed(chain) => {
        self.state = DispatchState::Active(chain);
        Ok(chain)
      }
      state => Err(Error::protocol(format!(
        "connection {} cannot activate in state {:?}",
        self.id, state
      ))),
    }
  }

  pub(crate) fn close(&mut self) {
    self.state = DispatchState::Closed;
  }
}

/// Sniff `stream`, install the matching chain and run it.
pub(crate) async fn dispatch(mut conn: ConnectionContext, stream: TcpStream) -> Result<()> {
  let result = run(&mut conn, stream).await;
  conn.close();
  tracing::debug!(
    "connection {} from {} closed ({:?}, upstream {:?})",
    conn.id,
    conn.peer,
    conn.protocol,
    conn.upstream
  );
  result
}

async fn run(conn: &mut ConnectionContext, stream: TcpStream) -> Result<()> {
  conn.begin_sniff()?;
  let read_timeout = conn.proxy.config.read_timeout();
  let (verdict, stream) = match tokio::time::timeout(read_timeout, sniff(stream)).await {
    Err(_) => {
      tracing::debug!("connection {} sent nothing within {:?}", conn.id, read_timeout);
      return Ok(());
    }
    Ok(result) => match result? {
      Some(sniffed) => sniffed,
      None => return Ok(()),
    },
  };
  let Some(chain) = Chain::from_verdict(verdict) else {
    return Err(Error::protocol(format!(
      "unrecognized protocol from {}",
      conn.peer
    )));
  };
  conn.install(chain)?;
  let chain = conn.activate()?;
  let stream: BoxedIo = Box::new(stream);
  match chain {
    Chain::Plain | Chain::Connect => {
      let outcome = HttpSession::direct(conn, false).serve(stream).await?;
      handle_outcome(conn, outcome).await
    }
    Chain::Tls => {
      let (start, sni) = tls::read_client_hello(stream).await?;
      let hostname = sni.unwrap_or_else(|| conn.proxy.config.default_tls_host.clone());
      let binding = conn.proxy.certificates.binding(&hostname).await?;
      let tls_stream = start
        .into_stream(binding.server_config())
        .await
        .map_err(|e| Error::tls_error(format!("handshake for {} failed: {}", hostname, e)))?;
      let outcome = HttpSession::direct(conn, true)
        .serve(Box::new(tls_stream))
        .await?;
      handle_outcome(conn, outcome).await
    }
    Chain::Socks => {
      if conn.proxy.mode.is_reverse() {
        tracing::debug!("[SOCKS] refused by reverse proxy, closing {}", conn.peer);
        return Ok(());
      }
      let mut stream = stream;
      let request = Socks5Server::handle_handshake(&mut stream).await?;
      relay::socks_tunnel(conn, request, stream).await
    }
  }
}

async fn handle_outcome(conn: &mut ConnectionContext, outcome: SessionOutcome) -> Result<()> {
  match outcome {
    SessionOutcome::Closed => Ok(()),
    SessionOutcome::Connect { host, port, stream } => match conn.proxy.mode.clone() {
      ProxyMode::Forward { intercept: true } => {
        InterceptTunnel::new(conn, host, port).run(stream).await
      }
      ProxyMode::Forward { intercept: false } => {
        relay::connect_tunnel(conn, &host, port, stream).await
      }
      // CONNECT is already refused by the session
      ProxyMode::Reverse { .. } => Ok(()),
    },
  }
}
