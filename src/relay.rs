//! Opaque byte relay for non-intercepted CONNECT and SOCKS tunnels

use crate::dispatcher::ConnectionContext;
use crate::errors::{Error, ReplyError, Result};
use crate::socket::BoxedIo;
use crate::socks5::SocksRequest;
use crate::Response;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub(crate) const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Copy bytes both ways until either side closes or fails, then drop both.
///
/// Returns the bytes moved client to upstream and upstream to client; the
/// direction that did not finish reports what it copied before being
/// cancelled as zero.
pub async fn relay<C, U>(client: C, upstream: U) -> Result<(u64, u64)>
where
  C: AsyncRead + AsyncWrite + Unpin,
  U: AsyncRead + AsyncWrite + Unpin,
{
  let (mut client_read, mut client_write) = tokio::io::split(client);
  let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

  let client_to_upstream = async {
    let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
    let _ = upstream_write.shutdown().await;
    copied
  };
  let upstream_to_client = async {
    let copied = tokio::io::copy(&mut upstream_read, &mut client_write).await;
    let _ = client_write.shutdown().await;
    copied
  };

  tokio::select! {
    copied = client_to_upstream => Ok((copied?, 0)),
    copied = upstream_to_client => Ok((0, copied?)),
  }
}

/// Connect to the CONNECT target, then acknowledge and relay.
///
/// The `200` is only sent once the upstream accepted; a failed connect is
/// answered with `502 Bad Gateway`.
pub(crate) async fn connect_tunnel(
  conn: &mut ConnectionContext,
  host: &str,
  port: u16,
  mut client: BoxedIo,
) -> Result<()> {
  let upstream = match conn.proxy().connector.connect_tcp(host, port).await {
    Ok(upstream) => upstream,
    Err(e) => {
      let mut response = Response::status_only(StatusCode::BAD_GATEWAY);
      response
        .headers_mut()
        .insert(http::header::CONNECTION, http::HeaderValue::from_static("close"));
      client.write_all(&response.to_raw()).await?;
      client.flush().await?;
      return Err(Error::connection_error(format!(
        "[RELAY] connect to {}:{} failed: {}",
        host, port, e
      )));
    }
  };
  conn.set_upstream(format!("{}:{}", host, port));
  client.write_all(CONNECTION_ESTABLISHED).await?;
  client.flush().await?;
  tracing::debug!("[RELAY] tunnel to {}:{} established", host, port);
  let (sent, received) = relay(client, upstream).await?;
  tracing::debug!(
    "[RELAY] tunnel to {}:{} closed ({} bytes up, {} bytes down)",
    host,
    port,
    sent,
    received
  );
  Ok(())
}

/// Connect to the SOCKS target, then send the success reply and relay.
pub(crate) async fn socks_tunnel(
  conn: &mut ConnectionContext,
  request: SocksRequest,
  mut client: BoxedIo,
) -> Result<()> {
  let host = request.target.host();
  let port = request.target.port();
  let upstream = match conn.proxy().connector.connect_tcp(&host, port).await {
    Ok(upstream) => upstream,
    Err(e) => {
      let reply = ReplyError::from_connect_error(&e);
      request.reply_error(&mut client, reply).await?;
      return Err(Error::connection_error(format!(
        "[SOCKS] connect to {} failed: {} ({})",
        request.target, e, reply
      )));
    }
  };
  conn.set_upstream(request.target.to_string());
  request.reply_success(&mut client).await?;
  tracing::debug!("[SOCKS] tunnel to {} established", request.target);
  let (sent, received) = relay(client, upstream).await?;
  tracing::debug!(
    "[SOCKS] tunnel to {} closed ({} bytes up, {} bytes down)",
    request.target,
    sent,
    received
  );
  Ok(())
}
