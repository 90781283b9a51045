//! Forward vs reverse proxy selection and the state shared by every
//! connection of one instance

use crate::ca::{CertificateAuthority, CertificateManager, CertificateProvider};
use crate::config::{ProxyAuth, ProxyConfig};
use crate::connector::{Connector, ConnectorBuilder};
use crate::errors::{Error, Result};
use crate::expectation::Expectations;
use crate::record::LogFilter;
use crate::server::{ProxyServer, RunState};
use crate::tls::Certificate;
use std::fmt::{Display, Formatter};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Fixed upstream of a reverse proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
  /// host name or address
  pub host: String,
  /// port
  pub port: u16,
}

impl Display for Upstream {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    if self.host.contains(':') {
      write!(f, "[{}]:{}", self.host, self.port)
    } else {
      write!(f, "{}:{}", self.host, self.port)
    }
  }
}

/// What an instance does with traffic no expectation answered.
///
/// Chosen once when the instance is built and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyMode {
  /// Arbitrary destinations taken from CONNECT targets, absolute-form
  /// requests and `Host` headers.
  Forward {
    /// terminate TLS inside CONNECT tunnels instead of relaying bytes
    intercept: bool,
  },
  /// Everything goes to one fixed upstream. No CONNECT, no SOCKS.
  Reverse {
    /// the upstream
    upstream: Upstream,
  },
}

impl ProxyMode {
  /// Derive the mode from a config: a remote host and port mean reverse.
  pub fn from_config(config: &ProxyConfig) -> Result<ProxyMode> {
    match (&config.remote_host, config.remote_port) {
      (None, None) => Ok(ProxyMode::Forward {
        intercept: config.intercept_connect,
      }),
      (Some(host), Some(port)) => {
        let host = host.trim();
        if host.is_empty() {
          return Err(Error::config("remote host is empty"));
        }
        Ok(ProxyMode::Reverse {
          upstream: Upstream {
            host: host
              .strip_prefix('[')
              .and_then(|h| h.strip_suffix(']'))
              .unwrap_or(host)
              .to_string(),
            port,
          },
        })
      }
      (Some(_), None) => Err(Error::config("remote host given without a remote port")),
      (None, Some(_)) => Err(Error::config("remote port given without a remote host")),
    }
  }

  /// Forward proxy
  pub fn is_forward(&self) -> bool {
    matches!(self, ProxyMode::Forward { .. })
  }

  /// Reverse proxy
  pub fn is_reverse(&self) -> bool {
    matches!(self, ProxyMode::Reverse { .. })
  }
}

/// Everything the connections of one instance share.
pub(crate) struct ProxyContext {
  pub(crate) config: ProxyConfig,
  pub(crate) mode: ProxyMode,
  pub(crate) log: Arc<LogFilter>,
  pub(crate) expectations: Arc<Expectations>,
  pub(crate) certificates: Arc<CertificateManager>,
  pub(crate) connector: Connector,
  bound_port: AtomicU16,
  state: Mutex<RunState>,
  shutdown: watch::Sender<bool>,
  next_connection_id: AtomicU64,
}

impl ProxyContext {
  pub(crate) fn next_connection_id(&self) -> u64 {
    self.next_connection_id.fetch_add(1, Ordering::Relaxed)
  }

  pub(crate) fn state(&self) -> RunState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub(crate) fn set_state(&self, state: RunState) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
  }

  /// Swap the state only if it currently is `from`.
  pub(crate) fn transition(&self, from: RunState, to: RunState) -> bool {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    if *state != from {
      return false;
    }
    *state = to;
    true
  }

  /// Port actually bound, which differs from the configured one when that
  /// was `0`.
  pub(crate) fn local_port(&self) -> u16 {
    match self.bound_port.load(Ordering::Acquire) {
      0 => self.config.local_port.unwrap_or_default(),
      port => port,
    }
  }

  pub(crate) fn set_bound_port(&self, port: u16) {
    self.bound_port.store(port, Ordering::Release);
  }

  pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
    self.shutdown.subscribe()
  }

  pub(crate) fn arm_shutdown(&self) {
    self.shutdown.send_replace(false);
  }

  /// Ask the accept loop to wind down. Used by the control plane, which runs
  /// inside a connection task and so cannot wait for the loop itself.
  pub(crate) fn request_stop(&self) {
    self.shutdown.send_replace(true);
  }

  /// Whether `host:port` names this very instance, so forwarding to it would
  /// loop.
  pub(crate) fn is_self(&self, host: &str, port: u16) -> bool {
    if port != self.local_port() {
      return false;
    }
    if host.eq_ignore_ascii_case("localhost") {
      return true;
    }
    match host.parse::<IpAddr>() {
      Ok(ip) => ip.is_loopback() || ip.is_unspecified() || ip == self.config.bind_address,
      Err(_) => false,
    }
  }
}

/// Builds a proxy instance from a local port and an optional fixed
/// upstream.
///
/// ```rust,no_run
/// # async fn run() -> proxymock::Result<()> {
/// let forward = proxymock::ProxyBuilder::new().local_port(1080).start().await?;
/// let reverse = proxymock::ProxyBuilder::new()
///   .local_port(8443)
///   .remote("backend.internal", 443)
///   .start()
///   .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ProxyBuilder {
  config: ProxyConfig,
  expectations: Option<Arc<Expectations>>,
  certificate_provider: Option<Arc<dyn CertificateProvider>>,
  root_certificates: Vec<Certificate>,
}

impl ProxyBuilder {
  /// Builder with default configuration and no local port yet
  pub fn new() -> Self {
    Self::default()
  }

  /// Builder starting from a loaded configuration
  pub fn from_config(config: ProxyConfig) -> Self {
    Self {
      config,
      ..Self::default()
    }
  }

  /// Port to listen on, `0` for an ephemeral one
  pub fn local_port(mut self, port: u16) -> Self {
    self.config.local_port = Some(port);
    self
  }

  /// Turn the instance into a reverse proxy for `host:port`
  pub fn remote(mut self, host: impl Into<String>, port: u16) -> Self {
    self.config.remote_host = Some(host.into());
    self.config.remote_port = Some(port);
    self
  }

  /// Terminate TLS inside CONNECT tunnels (default) or relay them opaquely
  pub fn intercept_connect(mut self, value: bool) -> Self {
    self.config.intercept_connect = value;
    self
  }

  /// Forward unmatched requests (default) or answer them with `404`
  pub fn forward_unmatched(mut self, value: bool) -> Self {
    self.config.forward_unmatched = value;
    self
  }

  /// Verify upstream certificates against the added roots
  pub fn verify_upstream_certs(mut self, value: bool) -> Self {
    self.config.verify_upstream_certs = value;
    self
  }

  /// Upstream connect timeout, with millisecond precision
  pub fn connect_timeout(mut self, timeout: Duration) -> Self {
    self.config.connect_timeout = timeout.as_millis() as u64;
    self
  }

  /// Idle read timeout, with millisecond precision
  pub fn read_timeout(mut self, timeout: Duration) -> Self {
    self.config.read_timeout = timeout.as_millis() as u64;
    self
  }

  /// How long stop waits for in-flight connections
  pub fn shutdown_grace(mut self, grace: Duration) -> Self {
    self.config.shutdown_grace = grace.as_millis() as u64;
    self
  }

  /// Maximum concurrent connections
  pub fn max_connections(mut self, value: usize) -> Self {
    self.config.max_connections = value;
    self
  }

  /// Limit on the request line plus headers
  pub fn max_header_size(mut self, value: usize) -> Self {
    self.config.max_header_size = value;
    self
  }

  /// Limit on decoded bodies, in bytes
  pub fn max_body_size(mut self, value: usize) -> Self {
    self.config.max_body_size = value;
    self
  }

  /// Address to bind
  pub fn bind_address(mut self, address: IpAddr) -> Self {
    self.config.bind_address = address;
    self
  }

  /// Sign intercepted certificates with the CA in these PEM files
  pub fn ca_files(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
    self.config.ca_cert_path = Some(cert_path.into());
    self.config.ca_key_path = Some(key_path.into());
    self
  }

  /// Certificate hostname for TLS clients without SNI
  pub fn default_tls_host(mut self, host: impl Into<String>) -> Self {
    self.config.default_tls_host = host.into();
    self
  }

  /// Require proxy Basic authentication
  pub fn proxy_auth(mut self, auth: ProxyAuth) -> Self {
    self.config.proxy_auth = Some(auth);
    self
  }

  /// Share an expectation store with the caller
  pub fn expectations(mut self, expectations: Arc<Expectations>) -> Self {
    self.expectations = Some(expectations);
    self
  }

  /// Issue intercepted certificates through a custom provider, overriding
  /// the configured CA files
  pub fn certificate_provider(mut self, provider: Arc<dyn CertificateProvider>) -> Self {
    self.certificate_provider = Some(provider);
    self
  }

  /// Trust an extra root when verifying upstreams
  pub fn add_root_certificate(mut self, certificate: Certificate) -> Self {
    self.root_certificates.push(certificate);
    self
  }

  /// The mode the current configuration selects
  pub fn mode(&self) -> Result<ProxyMode> {
    ProxyMode::from_config(&self.config)
  }

  /// Validate the configuration and assemble a stopped instance.
  pub fn build(self) -> Result<ProxyServer> {
    if self.config.local_port.is_none() {
      return Err(Error::config("local port was never specified"));
    }
    if self.config.max_connections == 0 {
      return Err(Error::config("max_connections must be at least 1"));
    }
    if self.config.connect_timeout == 0 || self.config.read_timeout == 0 {
      return Err(Error::config("timeouts must be at least one millisecond"));
    }
    let mode = self.mode()?;
    let provider: Arc<dyn CertificateProvider> = match self.certificate_provider {
      Some(provider) => provider,
      None => match (&self.config.ca_cert_path, &self.config.ca_key_path) {
        (Some(cert), Some(key)) => Arc::new(CertificateAuthority::load(cert, key)?),
        (None, None) => Arc::new(CertificateAuthority::ephemeral()?),
        _ => {
          return Err(Error::config(
            "ca_cert_path and ca_key_path must be given together",
          ))
        }
      },
    };
    let connector = ConnectorBuilder::default()
      .certs_verification(self.config.verify_upstream_certs)
      .certificate(self.root_certificates)
      .connect_timeout(Some(self.config.connect_timeout()))
      .read_timeout(Some(self.config.read_timeout()))
      .build()?;
    let (shutdown, _) = watch::channel(false);
    tracing::debug!("building {:?} proxy", mode);
    let ctx = ProxyContext {
      mode,
      log: Arc::new(LogFilter::new()),
      expectations: self
        .expectations
        .unwrap_or_else(|| Arc::new(Expectations::new())),
      certificates: Arc::new(CertificateManager::new(provider)),
      connector,
      bound_port: AtomicU16::new(0),
      state: Mutex::new(RunState::Stopped),
      shutdown,
      next_connection_id: AtomicU64::new(1),
      config: self.config,
    };
    Ok(ProxyServer::new(Arc::new(ctx)))
  }

  /// Build and start in one go.
  pub async fn start(self) -> Result<ProxyServer> {
    let server = self.build()?;
    server.start().await?;
    Ok(server)
  }
}
