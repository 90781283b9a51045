//! Proxy instance lifecycle and the accept loop

use crate::dispatcher::{self, ConnectionContext};
use crate::errors::{Error, Result};
use crate::expectation::Expectations;
use crate::proxy::{ProxyBuilder, ProxyContext, ProxyMode};
use crate::record::LogFilter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use rustls_pki_types::CertificateDer;
use tracing::Instrument;

const LISTEN_BACKLOG: u32 = 1024;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Running state of a proxy instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
  /// not listening
  Stopped,
  /// binding
  Starting,
  /// accepting connections
  Running,
  /// draining connections
  Stopping,
}

/// Start, stop, query and reset a proxy, wherever it runs.
#[async_trait::async_trait]
pub trait ProxyLifecycle: Send + Sync {
  /// Start listening
  async fn start(&self) -> Result<()>;
  /// Stop listening and drain connections. Never fails on an instance that
  /// is not running.
  async fn stop(&self) -> Result<()>;
  /// Whether the instance accepts connections
  async fn is_running(&self) -> bool;
  /// Clear the exchange log
  async fn reset(&self) -> Result<()>;
}

/// A proxy instance in this process.
pub struct ProxyServer {
  ctx: Arc<ProxyContext>,
  accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProxyServer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProxyServer")
      .field("mode", &self.ctx.mode)
      .field("local_port", &self.ctx.local_port())
      .field("state", &self.ctx.state())
      .finish()
  }
}

impl ProxyServer {
  pub(crate) fn new(ctx: Arc<ProxyContext>) -> Self {
    Self {
      ctx,
      accept_task: Mutex::new(None),
    }
  }

  pub(crate) fn context(&self) -> Arc<ProxyContext> {
    self.ctx.clone()
  }

  /// Shortcut for [`ProxyBuilder::new`]
  pub fn builder() -> ProxyBuilder {
    ProxyBuilder::new()
  }

  /// Bind the port and start accepting.
  ///
  /// Fails with [`Error::Lifecycle`] when the instance is already running
  /// or the port cannot be bound; nothing is left behind in either case.
  pub async fn start(&self) -> Result<()> {
    let mut task = self.accept_task.lock().await;
    if task.as_ref().is_some_and(|handle| handle.is_finished()) {
      task.take();
    }
    if task.is_some() || !self.ctx.transition(RunState::Stopped, RunState::Starting) {
      return Err(Error::lifecycle(format!(
        "proxy on port {} is already {:?}",
        self.ctx.local_port(),
        self.ctx.state()
      )));
    }
    let addr = SocketAddr::new(
      self.ctx.config.bind_address,
      self.ctx.config.local_port.unwrap_or_default(),
    );
    let listener = match bind(addr) {
      Ok(listener) => listener,
      Err(e) => {
        self.ctx.set_state(RunState::Stopped);
        return Err(Error::lifecycle(format!("failed to bind {}: {}", addr, e)));
      }
    };
    let local_addr = match listener.local_addr() {
      Ok(local_addr) => local_addr,
      Err(e) => {
        self.ctx.set_state(RunState::Stopped);
        return Err(Error::lifecycle(format!("failed to bind {}: {}", addr, e)));
      }
    };
    self.ctx.set_bound_port(local_addr.port());
    self.ctx.arm_shutdown();
    let shutdown = self.ctx.subscribe_shutdown();
    self.ctx.set_state(RunState::Running);
    tracing::info!("{:?} proxy listening on {}", self.ctx.mode, local_addr);
    *task = Some(tokio::spawn(accept_loop(self.ctx.clone(), listener, shutdown)));
    Ok(())
  }

  /// Close the listener, give in-flight connections the grace period, then
  /// abort the rest. Idempotent.
  pub async fn stop(&self) -> Result<()> {
    let mut task = self.accept_task.lock().await;
    let Some(handle) = task.take() else {
      return Ok(());
    };
    self.ctx.transition(RunState::Running, RunState::Stopping);
    self.ctx.request_stop();
    if let Err(e) = handle.await {
      tracing::warn!("accept loop ended abnormally: {}", e);
    }
    self.ctx.set_state(RunState::Stopped);
    Ok(())
  }

  /// Whether the instance accepts connections
  pub fn is_running(&self) -> bool {
    self.ctx.state() == RunState::Running
  }

  /// Current state
  pub fn state(&self) -> RunState {
    self.ctx.state()
  }

  /// Clear the exchange log. The listener is not touched.
  pub fn reset(&self) {
    self.ctx.log.reset();
    tracing::info!("[LOG] reset");
  }

  /// Listening port, resolved once an ephemeral port was bound
  pub fn local_port(&self) -> u16 {
    self.ctx.local_port()
  }

  /// Forward or reverse
  pub fn mode(&self) -> &ProxyMode {
    &self.ctx.mode
  }

  /// Exchanges seen so far
  pub fn log(&self) -> Arc<LogFilter> {
    self.ctx.log.clone()
  }

  /// Expectation store consulted before forwarding
  pub fn expectations(&self) -> Arc<Expectations> {
    self.ctx.expectations.clone()
  }

  /// Root certificate intercepted connections chain to, PEM encoded
  pub fn ca_cert_pem(&self) -> String {
    self.ctx.certificates.ca_cert_pem()
  }

  /// Root certificate intercepted connections chain to, DER encoded
  pub fn ca_cert_der(&self) -> CertificateDer<'static> {
    self.ctx.certificates.ca_cert_der()
  }
}

impl Drop for ProxyServer {
  fn drop(&mut self) {
    self.ctx.request_stop();
  }
}

#[async_trait::async_trait]
impl ProxyLifecycle for ProxyServer {
  async fn start(&self) -> Result<()> {
    ProxyServer::start(self).await
  }

  async fn stop(&self) -> Result<()> {
    ProxyServer::stop(self).await
  }

  async fn is_running(&self) -> bool {
    ProxyServer::is_running(self)
  }

  async fn reset(&self) -> Result<()> {
    ProxyServer::reset(self);
    Ok(())
  }
}

fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
  let socket = if addr.is_ipv4() {
    TcpSocket::new_v4()?
  } else {
    TcpSocket::new_v6()?
  };
  // lets a restart rebind while old connections sit in TIME_WAIT
  #[cfg(not(windows))]
  socket.set_reuseaddr(true)?;
  socket.bind(addr)?;
  socket.listen(LISTEN_BACKLOG)
}

async fn accept_loop(ctx: Arc<ProxyContext>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
  let limit = Arc::new(Semaphore::new(ctx.config.max_connections));
  let mut connections = JoinSet::new();
  loop {
    tokio::select! {
      changed = shutdown.changed() => {
        if changed.is_err() || *shutdown.borrow() {
          break;
        }
      }
      accepted = listener.accept() => match accepted {
        Ok((stream, peer)) => {
          let Ok(permit) = limit.clone().try_acquire_owned() else {
            tracing::warn!(
              "connection limit {} reached, dropping {}",
              ctx.config.max_connections,
              peer
            );
            continue;
          };
          let _ = stream.set_nodelay(true);
          let conn = ConnectionContext::new(ctx.clone(), peer);
          let span = tracing::info_span!("connection", id = conn.id(), peer = %peer);
          connections.spawn(
            async move {
              if let Err(e) = dispatcher::dispatch(conn, stream).await {
                tracing::debug!("connection error: {}", e);
              }
              drop(permit);
            }
            .instrument(span),
          );
        }
        Err(e) => {
          tracing::error!("failed to accept connection: {}", e);
          tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
        }
      },
      Some(_) = connections.join_next(), if !connections.is_empty() => {}
    }
  }

  ctx.transition(RunState::Running, RunState::Stopping);
  drop(listener);
  let grace = ctx.config.shutdown_grace();
  let drained = tokio::time::timeout(grace, async {
    while connections.join_next().await.is_some() {}
  })
  .await;
  if drained.is_err() {
    tracing::warn!(
      "{} connections still open after {:?}, aborting them",
      connections.len(),
      grace
    );
    connections.shutdown().await;
  }
  ctx.set_state(RunState::Stopped);
  tracing::info!("proxy on port {} stopped", ctx.local_port());
}
