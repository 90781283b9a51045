//! Decoded HTTP exchanges on a client connection
//!
//! A session reads requests one at a time and answers each in order: the
//! control plane first, then expectations, then the upstream chosen by the
//! route and the proxy mode.

use crate::client::Status;
use crate::config::ProxyConfig;
use crate::dispatcher::ConnectionContext;
use crate::errors::{Error, Result};
use crate::proxy::ProxyMode;
use crate::record::HttpRecord;
use crate::socket::{BoxedIo, PrefixedStream, Socket};
use crate::{Request, RequestReader, Response, ResponseReader};
use bytes::Bytes;
use http::{header, HeaderValue, Method, StatusCode};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Prefix of the control endpoints every instance answers itself.
pub(crate) const CONTROL_PREFIX: &str = "/proxymock/";

const PROXY_AUTH_CHALLENGE: &str = "Basic realm=\"proxymock\"";

/// Where unmatched requests of a session go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
  /// Straight on the listening port; the mode decides the upstream.
  Direct { secure: bool },
  /// Inside an intercepted CONNECT tunnel to `host:port`.
  Tunnel {
    host: String,
    port: u16,
    secure: bool,
  },
}

/// How a session ended.
pub(crate) enum SessionOutcome {
  Closed,
  /// An accepted CONNECT. The stream still holds whatever the client sent
  /// after the request head.
  Connect {
    host: String,
    port: u16,
    stream: BoxedIo,
  },
}

struct UpstreamConn {
  key: String,
  stream: BufReader<Socket>,
}

struct Exchange {
  response: Response,
  mocked: bool,
  upstream: Option<String>,
  control: bool,
  stop: bool,
}

impl Exchange {
  fn local(response: Response) -> Self {
    Exchange {
      response,
      mocked: false,
      upstream: None,
      control: false,
      stop: false,
    }
  }

  fn status(status_code: StatusCode) -> Self {
    Self::local(Response::status_only(status_code))
  }
}

pub(crate) struct HttpSession<'a> {
  conn: &'a mut ConnectionContext,
  route: Route,
  upstream: Option<UpstreamConn>,
}

impl<'a> HttpSession<'a> {
  pub(crate) fn direct(conn: &'a mut ConnectionContext, secure: bool) -> Self {
    Self {
      conn,
      route: Route::Direct { secure },
      upstream: None,
    }
  }

  pub(crate) fn tunnel(conn: &'a mut ConnectionContext, host: String, port: u16, secure: bool) -> Self {
    Self {
      conn,
      route: Route::Tunnel { host, port, secure },
      upstream: None,
    }
  }

  /// Answer requests until the client goes away, a response closes the
  /// connection, or a CONNECT hands the stream to a tunnel.
  pub(crate) async fn serve(mut self, client: BoxedIo) -> Result<SessionOutcome> {
    let config = &self.conn.proxy().config;
    let (read_timeout, max_header_size, max_body_size) = (
      config.read_timeout(),
      config.max_header_size,
      config.max_body_size,
    );
    let mut client = BufReader::new(client);
    loop {
      let read = RequestReader::new(&mut client)
        .max_header_size(max_header_size)
        .max_body_size(max_body_size)
        .read();
      let request = match tokio::time::timeout(read_timeout, read).await {
        Err(_) => {
          tracing::debug!("connection {} idle for {:?}", self.conn.id(), read_timeout);
          return Ok(SessionOutcome::Closed);
        }
        Ok(Ok(None)) => return Ok(SessionOutcome::Closed),
        Ok(Ok(Some(request))) => request,
        Ok(Err(e)) => {
          tracing::debug!("connection {} sent a bad request: {}", self.conn.id(), e);
          let response = closing(Response::status_only(StatusCode::BAD_REQUEST));
          let _ = client.write_all(&response.to_raw()).await;
          let _ = client.flush().await;
          return Ok(SessionOutcome::Closed);
        }
      };

      if request.method() == Method::CONNECT {
        match self.accept_connect(&request) {
          Ok((host, port)) => {
            let leftover = Bytes::copy_from_slice(client.buffer());
            let stream = PrefixedStream::new(leftover, client.into_inner());
            tracing::debug!("connection {} CONNECT {}:{}", self.conn.id(), host, port);
            return Ok(SessionOutcome::Connect {
              host,
              port,
              stream: Box::new(stream),
            });
          }
          Err(exchange) => {
            let keep_alive = exchange.response.status_code() == StatusCode::PROXY_AUTHENTICATION_REQUIRED
              && request.keep_alive();
            if !self.reply(&mut client, &request, exchange, keep_alive).await? {
              return Ok(SessionOutcome::Closed);
            }
            continue;
          }
        }
      }

      let exchange = self.respond(&request).await;
      let keep_alive = request.keep_alive() && exchange.response.keep_alive() && !exchange.stop;
      if !self.reply(&mut client, &request, exchange, keep_alive).await? {
        return Ok(SessionOutcome::Closed);
      }
    }
  }

  /// Record and write one exchange. Returns whether the connection stays
  /// open.
  async fn reply(
    &self,
    client: &mut BufReader<BoxedIo>,
    request: &Request,
    exchange: Exchange,
    keep_alive: bool,
  ) -> Result<bool> {
    let Exchange {
      mut response,
      mocked,
      upstream,
      control,
      stop,
    } = exchange;
    if !keep_alive {
      response = closing(response);
    }
    if !control {
      self.conn.log().record(
        HttpRecord::new(self.conn.id(), self.conn.peer(), request, &response)
          .upstream(upstream)
          .mocked(mocked),
      );
    }
    let raw = if request.method() == Method::HEAD {
      head_only(&response.to_raw())
    } else {
      response.to_raw()
    };
    client.write_all(&raw).await?;
    client.flush().await?;
    if stop {
      tracing::info!("stop requested by {}", self.conn.peer());
      self.conn.proxy().request_stop();
    }
    Ok(keep_alive)
  }

  /// Check a CONNECT request; `Err` carries the refusal to send.
  fn accept_connect(&self, request: &Request) -> std::result::Result<(String, u16), Exchange> {
    if self.conn.mode().is_reverse() || !matches!(self.route, Route::Direct { .. }) {
      return Err(Exchange::status(StatusCode::METHOD_NOT_ALLOWED));
    }
    if let Some(exchange) = self.check_proxy_auth(request) {
      return Err(exchange);
    }
    request
      .authority(443)
      .ok_or_else(|| Exchange::status(StatusCode::BAD_REQUEST))
  }

  fn check_proxy_auth(&self, request: &Request) -> Option<Exchange> {
    let auth = self.conn.proxy().config.proxy_auth.as_ref()?;
    if auth.matches(request.headers().get(header::PROXY_AUTHORIZATION)) {
      return None;
    }
    tracing::debug!("connection {} failed proxy authentication", self.conn.id());
    let mut response = Response::status_only(StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    response.headers_mut().insert(
      header::PROXY_AUTHENTICATE,
      HeaderValue::from_static(PROXY_AUTH_CHALLENGE),
    );
    Some(Exchange::local(response))
  }

  async fn respond(&mut self, request: &Request) -> Exchange {
    if let Some(exchange) = self.control(request) {
      return exchange;
    }
    if self.conn.mode().is_forward()
      && request.is_absolute_form()
      && matches!(self.route, Route::Direct { .. })
    {
      if let Some(exchange) = self.check_proxy_auth(request) {
        return exchange;
      }
    }

    match self.conn.proxy().expectations.respond(request).await {
      Ok(Some(response)) => {
        return Exchange {
          mocked: true,
          ..Exchange::local(response)
        }
      }
      Ok(None) => {}
      Err(e) => {
        tracing::warn!("expectation matcher failed: {}", e);
        return Exchange::status(StatusCode::INTERNAL_SERVER_ERROR);
      }
    }

    if !self.conn.proxy().config.forward_unmatched {
      return Exchange::status(StatusCode::NOT_FOUND);
    }
    let Some((host, port, secure)) = self.target(request) else {
      return Exchange::status(StatusCode::NOT_FOUND);
    };
    let upstream = if host.contains(':') {
      format!("[{}]:{}", host, port)
    } else {
      format!("{}:{}", host, port)
    };
    match self.forward(request, &host, port, secure).await {
      Ok(response) => Exchange {
        upstream: Some(upstream),
        ..Exchange::local(response)
      },
      Err(e) => {
        tracing::warn!("forwarding to {} failed: {}", upstream, e);
        Exchange {
          upstream: Some(upstream),
          ..Exchange::status(StatusCode::BAD_GATEWAY)
        }
      }
    }
  }

  /// Requests to `PUT /proxymock/...` addressed to this instance.
  fn control(&self, request: &Request) -> Option<Exchange> {
    if !matches!(self.route, Route::Direct { .. })
      || request.method() != Method::PUT
      || !request.path().starts_with(CONTROL_PREFIX)
    {
      return None;
    }
    if request.is_absolute_form() {
      let (host, port) = request.authority(80)?;
      if !self.conn.proxy().is_self(&host, port) {
        return None;
      }
    }
    let proxy = self.conn.proxy();
    let (response, stop) = match &request.path()[CONTROL_PREFIX.len()..] {
      "status" => {
        let status = Status {
          ports: vec![proxy.local_port()],
        };
        (json_response(&status), false)
      }
      "reset" => {
        proxy.log.reset();
        tracing::info!("[LOG] reset by {}", self.conn.peer());
        (Response::status_only(StatusCode::OK), false)
      }
      "stop" => (Response::status_only(StatusCode::OK), true),
      _ => (Response::status_only(StatusCode::NOT_FOUND), false),
    };
    Some(Exchange {
      control: true,
      stop,
      ..Exchange::local(response)
    })
  }

  /// Upstream for an unmatched request, `None` when there is nowhere to go.
  fn target(&self, request: &Request) -> Option<(String, u16, bool)> {
    match (&self.route, self.conn.mode()) {
      (Route::Tunnel { host, port, secure }, _) => Some((host.clone(), *port, *secure)),
      (Route::Direct { secure }, ProxyMode::Reverse { upstream }) => {
        Some((upstream.host.clone(), upstream.port, *secure))
      }
      (Route::Direct { secure }, ProxyMode::Forward { .. }) => {
        let secure = *secure || request.uri().scheme_str() == Some("https");
        let (host, port) = request.authority(if secure { 443 } else { 80 })?;
        if self.conn.proxy().is_self(&host, port) {
          tracing::debug!("refusing to forward {}:{} to ourselves", host, port);
          return None;
        }
        Some((host, port, secure))
      }
    }
  }

  async fn forward(&mut self, request: &Request, host: &str, port: u16, secure: bool) -> Result<Response> {
    let proxy = self.conn.proxy().clone();
    let key = format!("{}://{}:{}", if secure { "https" } else { "http" }, host, port);
    let pooled = match self.upstream.take() {
      Some(mut upstream) if upstream.key == key => {
        if upstream.is_idle().await {
          Some(upstream)
        } else {
          tracing::debug!("connection {} dropped stale upstream {}", self.conn.id(), key);
          None
        }
      }
      _ => None,
    };
    if let Some(mut upstream) = pooled {
      if let Some(response) = upstream.exchange(request, &proxy.config).await? {
        self.keep_upstream(upstream, &response);
        return Ok(response);
      }
      tracing::debug!(
        "connection {} upstream {} closed before answering, reopening",
        self.conn.id(),
        key
      );
    }
    let socket = proxy.connector.connect(host, port, secure).await?;
    tracing::debug!("connection {} opened upstream {}", self.conn.id(), key);
    self.conn.set_upstream(format!("{}:{}", host, port));
    let mut upstream = UpstreamConn {
      key,
      stream: BufReader::new(socket),
    };
    let response = upstream.exchange(request, &proxy.config).await?.ok_or_else(|| {
      Error::connection_error(format!("{} closed without a response", upstream.key))
    })?;
    self.keep_upstream(upstream, &response);
    Ok(response)
  }

  fn keep_upstream(&mut self, upstream: UpstreamConn, response: &Response) {
    if response.reusable_connection() {
      self.upstream = Some(upstream);
    }
  }
}

impl UpstreamConn {
  /// Whether a pooled connection is still open with nothing unread on it.
  async fn is_idle(&mut self) -> bool {
    if !self.stream.buffer().is_empty() {
      return false;
    }
    // a live idle socket has nothing to read yet, so the zero timeout elapses
    tokio::time::timeout(Duration::ZERO, self.stream.fill_buf())
      .await
      .is_err()
  }

  /// Send `request` and decode the answer. `Ok(None)` means the upstream
  /// went away before sending a single byte.
  async fn exchange(&mut self, request: &Request, config: &ProxyConfig) -> Result<Option<Response>> {
    let read_timeout = self
      .stream
      .get_ref()
      .read_timeout()
      .unwrap_or_else(|| config.read_timeout());
    let (stream, key) = (&mut self.stream, &self.key);
    let raw = request.to_raw();
    if stream.write_all(&raw).await.is_err() || stream.flush().await.is_err() {
      return Ok(None);
    }
    let read = async {
      match stream.fill_buf().await {
        Ok([]) | Err(_) => return Ok(None),
        Ok(_) => {}
      }
      ResponseReader::new(&mut *stream, request.method())
        .max_header_size(config.max_header_size)
        .max_body_size(config.max_body_size)
        .read()
        .await
        .map(Some)
    };
    match tokio::time::timeout(read_timeout, read).await {
      Ok(result) => result,
      Err(_) => Err(Error::connection_error(format!(
        "no response from {} within {:?}",
        key, read_timeout
      ))),
    }
  }
}

fn closing(mut response: Response) -> Response {
  response
    .headers_mut()
    .insert(header::CONNECTION, HeaderValue::from_static("close"));
  response
}

fn json_response<T: serde::Serialize>(value: &T) -> Response {
  match serde_json::to_vec(value) {
    Ok(body) => {
      let mut response = Response::from(
        http::Response::builder()
          .status(StatusCode::OK)
          .body(body)
          .unwrap_or_default(),
      );
      response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
      );
      response
    }
    Err(e) => {
      tracing::error!("failed to encode control response: {}", e);
      Response::status_only(StatusCode::INTERNAL_SERVER_ERROR)
    }
  }
}

/// Strip the body from an encoded response, keeping its headers.
fn head_only(raw: &Bytes) -> Bytes {
  match raw.windows(4).position(|w| w == b"\r\n\r\n") {
    Some(end) => raw.slice(..end + 4),
    None => raw.clone(),
  }
}
