//! Lifecycle control of a proxy running elsewhere

use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::server::ProxyLifecycle;
use crate::session::CONTROL_PREFIX;
use crate::{Request, Response, ResponseReader};
use bytes::Bytes;
use http::{header, Method};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of `PUT /proxymock/status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
  /// ports the instance listens on
  pub ports: Vec<u16>,
}

/// Drives a proxy over its control endpoints.
///
/// A client cannot launch a process, so [`ProxyClient::start`] only
/// succeeds against an instance that is already running.
#[derive(Debug, Clone)]
pub struct ProxyClient {
  host: String,
  port: u16,
  connector: Connector,
}

impl ProxyClient {
  /// Client for the instance listening on `host:port`
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self::with_connector(host, port, Connector::default())
  }

  /// Client using a preconfigured connector
  pub fn with_connector(host: impl Into<String>, port: u16, connector: Connector) -> Self {
    Self {
      host: host.into(),
      port,
      connector,
    }
  }

  async fn call(&self, command: &str) -> Result<Response> {
    let mut socket = self.connector.connect(&self.host, self.port, false).await?;
    let authority = if self.host.contains(':') {
      format!("[{}]:{}", self.host, self.port)
    } else {
      format!("{}:{}", self.host, self.port)
    };
    let request: Request = Request::builder()
      .method(Method::PUT)
      .uri(format!("http://{}{}{}", authority, CONTROL_PREFIX, command))
      .header(header::CONNECTION, "close")
      .body(Bytes::new())?
      .into();
    socket.write_all(&request.to_raw()).await?;
    socket.flush().await?;
    let mut reader = BufReader::new(socket);
    let read = ResponseReader::new(&mut reader, &Method::PUT).read();
    let response = tokio::time::timeout(CONTROL_TIMEOUT, read)
      .await
      .map_err(|_| Error::connection_error(format!("{} did not answer {}", authority, command)))??;
    if !response.status_code().is_success() {
      return Err(Error::connection_error(format!(
        "{} answered {} with {}",
        authority,
        command,
        response.status_code()
      )));
    }
    Ok(response)
  }

  /// Ports the remote instance listens on
  pub async fn status(&self) -> Result<Status> {
    let response = self.call("status").await?;
    serde_json::from_slice(response.body())
      .map_err(|e| Error::protocol(format!("invalid status body: {}", e)))
  }

  /// Succeeds only when the remote instance is already running.
  pub async fn start(&self) -> Result<()> {
    self.status().await.map(|_| ()).map_err(|e| {
      Error::lifecycle(format!(
        "proxy at {}:{} is not running: {}",
        self.host, self.port, e
      ))
    })
  }

  /// Ask the remote instance to stop. An unreachable instance counts as
  /// stopped.
  pub async fn stop(&self) -> Result<()> {
    if let Err(e) = self.call("stop").await {
      tracing::debug!("stop of {}:{} ignored: {}", self.host, self.port, e);
    }
    Ok(())
  }

  /// Whether the remote instance answers its status endpoint
  pub async fn is_running(&self) -> bool {
    self.status().await.is_ok()
  }

  /// Clear the remote exchange log
  pub async fn reset(&self) -> Result<()> {
    self.call("reset").await.map(|_| ())
  }
}

#[async_trait::async_trait]
impl ProxyLifecycle for ProxyClient {
  async fn start(&self) -> Result<()> {
    ProxyClient::start(self).await
  }

  async fn stop(&self) -> Result<()> {
    ProxyClient::stop(self).await
  }

  async fn is_running(&self) -> bool {
    ProxyClient::is_running(self).await
  }

  async fn reset(&self) -> Result<()> {
    ProxyClient::reset(self).await
  }
}
