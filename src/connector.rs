use crate::errors::{new_io_error, Error, Result};
use crate::socket::{MaybeTlsStream, Socket};
use crate::tls::{self, Certificate, NoVerifier};
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// ConnectorBuilder
#[derive(Clone, Debug)]
pub struct ConnectorBuilder {
  certs_verification: bool,
  read_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  certificate: Vec<Certificate>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      certs_verification: false,
      read_timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      keepalive: false,
      certificate: vec![],
    }
  }
}

impl ConnectorBuilder {
  /// Controls the use of upstream certificate validation.
  ///
  /// Defaults to `false`: a mock sitting in front of test services usually
  /// talks to self-signed upstreams.
  pub fn certs_verification(mut self, value: bool) -> ConnectorBuilder {
    self.certs_verification = value;
    self
  }
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Sets value for the `SO_KEEPALIVE` option on this socket.
  ///
  /// Default is `false`.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Adds certificates to the set of roots trusted for upstream TLS.
  pub fn certificate(mut self, value: Vec<Certificate>) -> ConnectorBuilder {
    self.certificate = value;
    self
  }
  /// Read timeout callers apply while waiting on the upstream.
  ///
  /// Default is 30 seconds.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Set a timeout for only the connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
}

impl ConnectorBuilder {
  /// Combine the configuration of this builder to create a `Connector`.
  pub fn build(&self) -> Result<Connector> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    for cert in &self.certificate {
      cert.add_to_tls(&mut root_cert_store)?;
    }
    let config_builder = rustls::ClientConfig::builder_with_provider(tls::crypto_provider())
      .with_safe_default_protocol_versions()?;
    let config_builder = if !self.certs_verification {
      config_builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
    } else {
      config_builder.with_root_certificates(root_cert_store)
    };
    let mut config = config_builder.with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      read_timeout: self.read_timeout,
      tls: TlsConnector::from(Arc::new(config)),
    })
  }
}

/// Opens upstream connections, plain or TLS.
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  read_timeout: Option<Duration>,
  tls: TlsConnector,
}

impl std::fmt::Debug for Connector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connector")
      .field("connect_timeout", &self.connect_timeout)
      .field("read_timeout", &self.read_timeout)
      .finish()
  }
}

impl Connector {
  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??,
    };
    Ok(Socket::new(MaybeTlsStream::Tcp(s), addr, self.read_timeout))
  }

  /// Resolve `host` and connect to the first address that accepts.
  ///
  /// Returns the last connect error when every address fails, so callers
  /// can tell refused from unreachable.
  pub async fn connect_tcp(&self, host: &str, port: u16) -> std::io::Result<Socket> {
    let addrs = tokio::net::lookup_host((host, port)).await?;
    let mut last_error = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(socket) => {
          tracing::debug!("connected to {}:{} via {}", host, port, addr);
          return Ok(socket);
        }
        Err(Error::Io(e)) => last_error = Some(e),
        Err(e) => last_error = Some(std::io::Error::other(e.to_string())),
      }
    }
    Err(last_error.unwrap_or_else(|| {
      std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("no address found for {}", host),
      )
    }))
  }

  /// Connect to `host:port`, upgrading to TLS when `tls` is set.
  pub async fn connect(&self, host: &str, port: u16, tls: bool) -> Result<Socket> {
    let socket = self
      .connect_tcp(host, port)
      .await
      .map_err(|e| Error::connection_error(format!("connect to {}:{} failed: {}", host, port, e)))?;
    if tls {
      self.upgrade_to_tls(socket, host).await
    } else {
      Ok(socket)
    }
  }

  /// Run the client handshake on an established socket.
  pub async fn upgrade_to_tls(&self, stream: Socket, domain: &str) -> Result<Socket> {
    let domain = ServerName::try_from(domain.to_owned())
      .map_err(|e| Error::tls_error(format!("invalid server name {}: {}", domain, e)))?;
    let this = self.tls.clone();
    let tls = stream
      .tls(move |t| async move { this.connect(domain, t).await })
      .await
      .map_err(|e| Error::tls_error(format!("upstream handshake failed: {}", e)))?;
    Ok(tls)
  }

  /// Read timeout for upstream responses
  pub fn read_timeout(&self) -> Option<Duration> {
    self.read_timeout
  }
}

impl Default for Connector {
  fn default() -> Self {
    ConnectorBuilder::default()
      .build()
      .expect("new default connector failure")
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn connects_to_local_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connector = Connector::default();
    let socket = connector.connect("127.0.0.1", port, false).await.unwrap();
    assert_eq!(socket.peer_addr().port(), port);
    assert!(!socket.is_tls());
  }

  #[tokio::test]
  async fn refused_connect_keeps_error_kind() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let err = Connector::default()
      .connect_tcp("127.0.0.1", port)
      .await
      .unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
  }
}
