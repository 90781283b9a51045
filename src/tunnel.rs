//! TLS interception inside CONNECT tunnels

use crate::dispatcher::ConnectionContext;
use crate::errors::{Error, Result};
use crate::relay::CONNECTION_ESTABLISHED;
use crate::session::HttpSession;
use crate::sniff::{sniff, Verdict};
use crate::socket::BoxedIo;
use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsAcceptor;

/// Terminates the client side of an accepted CONNECT and serves the
/// tunnelled HTTP, plaintext or TLS, as decoded exchanges.
pub(crate) struct InterceptTunnel<'a> {
  conn: &'a mut ConnectionContext,
  host: String,
  port: u16,
}

impl<'a> InterceptTunnel<'a> {
  pub(crate) fn new(conn: &'a mut ConnectionContext, host: String, port: u16) -> Self {
    Self { conn, host, port }
  }

  /// Acknowledge the CONNECT, then sniff what the client sends through it.
  ///
  /// No upstream exists until the first unmatched request needs one.
  pub(crate) async fn run(self, mut client: BoxedIo) -> Result<()> {
    client.write_all(CONNECTION_ESTABLISHED).await?;
    client.flush().await?;
    tracing::debug!("[TUNNEL] intercepting {}:{}", self.host, self.port);

    let read_timeout = self.conn.proxy().config.read_timeout();
    let sniffed = match tokio::time::timeout(read_timeout, sniff(client)).await {
      Err(_) => {
        tracing::debug!("[TUNNEL] {}:{} idle after CONNECT", self.host, self.port);
        return Ok(());
      }
      Ok(result) => result?,
    };
    let Some((verdict, stream)) = sniffed else {
      return Ok(());
    };
    match verdict {
      Verdict::Tls => {
        let binding = match self.conn.proxy().certificates.binding(&self.host).await {
          Ok(binding) => binding,
          Err(e) => {
            tracing::warn!("[TUNNEL] no certificate for {}: {}", self.host, e);
            return Ok(());
          }
        };
        let acceptor = TlsAcceptor::from(binding.server_config());
        let tls_stream = acceptor.accept(stream).await.map_err(|e| {
          Error::tls_error(format!("[TUNNEL] handshake for {} failed: {}", self.host, e))
        })?;
        tracing::debug!("[TUNNEL] TLS established with client for {}", self.host);
        HttpSession::tunnel(self.conn, self.host, self.port, true)
          .serve(Box::new(tls_stream))
          .await?;
      }
      Verdict::Http { .. } => {
        HttpSession::tunnel(self.conn, self.host, self.port, false)
          .serve(Box::new(stream))
          .await?;
      }
      other => {
        tracing::debug!(
          "[TUNNEL] {:?} inside CONNECT to {}:{}, closing",
          other,
          self.host,
          self.port
        );
      }
    }
    Ok(())
  }
}
