use crate::{Request, Response};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// One request/response exchange seen by the proxy.
#[derive(Debug, Clone)]
pub struct HttpRecord {
  /// id of the connection that carried the exchange
  pub connection_id: u64,
  /// client address
  pub peer: SocketAddr,
  /// `host:port` the request was forwarded to, `None` when answered locally
  pub upstream: Option<String>,
  /// answered by an expectation
  pub mocked: bool,
  /// milliseconds since the unix epoch
  pub timestamp: u128,
  /// request
  pub request: Request,
  /// raw_request
  pub raw_request: Bytes,
  /// response
  pub response: Response,
  /// raw_response
  pub raw_response: Bytes,
}

impl HttpRecord {
  pub(crate) fn new(connection_id: u64, peer: SocketAddr, request: &Request, response: &Response) -> Self {
    let timestamp = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_millis())
      .unwrap_or_default();
    HttpRecord {
      connection_id,
      peer,
      upstream: None,
      mocked: false,
      timestamp,
      raw_request: request.to_raw(),
      request: request.clone(),
      raw_response: response.to_raw(),
      response: response.clone(),
    }
  }
  pub(crate) fn upstream(mut self, upstream: Option<String>) -> Self {
    self.upstream = upstream;
    self
  }
  pub(crate) fn mocked(mut self, mocked: bool) -> Self {
    self.mocked = mocked;
    self
  }
}

/// Append-only log of exchanges, shared by every connection of one proxy.
#[derive(Debug, Default)]
pub struct LogFilter {
  records: RwLock<Vec<HttpRecord>>,
}

impl LogFilter {
  /// Empty log
  pub fn new() -> Self {
    Self::default()
  }

  /// Append an exchange.
  pub fn record(&self, record: HttpRecord) {
    tracing::debug!(
      "[LOG] {} {} -> {}",
      record.request.method(),
      record.request.uri(),
      record.response.status_code()
    );
    let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
    records.push(record);
  }

  /// Consistent copy of everything recorded so far.
  pub fn snapshot(&self) -> Vec<HttpRecord> {
    self
      .records
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  /// Records matching `predicate`, oldest first.
  pub fn retrieve<F>(&self, predicate: F) -> Vec<HttpRecord>
  where
    F: Fn(&HttpRecord) -> bool,
  {
    self
      .records
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .iter()
      .filter(|r| predicate(r))
      .cloned()
      .collect()
  }

  /// Drop every record.
  pub fn reset(&self) {
    self
      .records
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .clear();
  }

  /// Number of records
  pub fn len(&self) -> usize {
    self.records.read().unwrap_or_else(|e| e.into_inner()).len()
  }

  /// Whether nothing was recorded
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
