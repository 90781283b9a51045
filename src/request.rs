use std::fmt::{Debug, Formatter};
use std::io::ErrorKind;

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, Request as HttpRequest, Uri, Version};
use tokio::io::AsyncBufRead;

use crate::errors::{new_io_error, Error, Result};
use crate::response::{
  framing, keep_alive, parse_version, read_body, read_head, version_str, DEFAULT_MAX_BODY_SIZE,
  DEFAULT_MAX_HEADER_SIZE,
};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// Headers only meaningful between a client and its proxy.
const PROXY_HOP_HEADERS: [&str; 2] = ["proxy-connection", "proxy-authorization"];

/// A decoded HTTP/1.x request.
#[derive(Default, Clone)]
pub struct Request {
  uri: Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  body: Bytes,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &format_args!("{}", self.body.escape_ascii()))
      .finish()
  }
}

impl PartialEq for Request {
  fn eq(&self, other: &Self) -> bool {
    self.method == other.method
      && self.uri == other.uri
      && self.version == other.version
      && self.headers == other.headers
      && self.body == other.body
  }
}

impl<T> From<HttpRequest<T>> for Request
where
  T: Into<Bytes>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      body: body.into(),
    }
  }
}

impl Request {
  /// Encode in origin-form for the upstream.
  ///
  /// An absolute-form target is reduced to its path and query, a missing
  /// `Host` header is filled from the target's authority, proxy-only
  /// headers are dropped and the body is framed with `Content-Length`.
  pub fn to_raw(&self) -> Bytes {
    let mut http_requests = Vec::new();
    http_requests.extend(self.method.as_str().as_bytes());
    http_requests.extend(SPACE);
    http_requests.extend(self.origin_form().as_bytes());
    http_requests.extend(SPACE);
    http_requests.extend(version_str(self.version).as_bytes());
    http_requests.extend(CR_LF);
    if self.headers.get(header::HOST).is_none() {
      if let Some(authority) = self.uri.authority() {
        http_requests.extend(header::HOST.as_str().as_bytes());
        http_requests.extend(COLON_SPACE);
        http_requests.extend(authority.as_str().as_bytes());
        http_requests.extend(CR_LF);
      }
    }
    let mut headers = self.headers.clone();
    for name in PROXY_HOP_HEADERS {
      headers.remove(name);
    }
    let framed = headers.remove(header::TRANSFER_ENCODING).is_some()
      || headers.remove(header::CONTENT_LENGTH).is_some();
    if framed || !self.body.is_empty() {
      headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.body.len()));
    }
    for (k, v) in headers.iter() {
      http_requests.extend(k.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(v.as_bytes());
      http_requests.extend(CR_LF);
    }
    http_requests.extend(CR_LF);
    http_requests.extend(self.body.as_ref());
    Bytes::from(http_requests)
  }

  /// Creates a new builder-style object to manufacture a `Request`
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }

  fn origin_form(&self) -> String {
    match self.uri.path_and_query() {
      Some(pq) if !pq.as_str().is_empty() => pq.as_str().to_string(),
      _ => "/".to_string(),
    }
  }
}

impl Request {
  /// Get the HTTP Method for this request.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Get the request target.
  #[inline]
  pub fn uri(&self) -> &Uri {
    &self.uri
  }
  /// Get a mutable reference to the request target.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut Uri {
    &mut self.uri
  }
  /// Get the HTTP Version for this request.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Get the headers for this request.
  #[inline]
  pub fn headers(&self) -> &HeaderMap<HeaderValue> {
    &self.headers
  }
  /// Get a mutable reference to the headers for this request.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap<HeaderValue> {
    &mut self.headers
  }
  /// Get the decoded body
  #[inline]
  pub fn body(&self) -> &Bytes {
    &self.body
  }
  /// Path component of the target, `/` when absent.
  pub fn path(&self) -> &str {
    match self.uri.path() {
      "" => "/",
      path => path,
    }
  }
  /// Whether the target is absolute-form (`http://host/path`).
  pub fn is_absolute_form(&self) -> bool {
    self.uri.scheme().is_some() && self.uri.authority().is_some()
  }
  /// Whether the connection may carry another exchange after this one.
  pub fn keep_alive(&self) -> bool {
    keep_alive(self.version, &self.headers)
  }
  /// Destination host and port: the target's authority when present,
  /// otherwise the `Host` header, with `default_port` filling a missing port.
  pub fn authority(&self, default_port: u16) -> Option<(String, u16)> {
    if let Some(authority) = self.uri.authority() {
      let port = authority.port_u16().unwrap_or_else(|| match self.uri.scheme_str() {
        Some("https") => 443,
        Some("http") => 80,
        _ => default_port,
      });
      return Some((strip_brackets(authority.host()), port));
    }
    let host = self.headers.get(header::HOST)?.to_str().ok()?;
    parse_host_port(host, default_port)
  }
  /// Host the request is addressed to, lowercase and without port.
  pub fn host(&self) -> Option<String> {
    self
      .authority(80)
      .map(|(host, _)| host.to_ascii_lowercase())
  }
}

/// Split `host[:port]`, tolerating bracketed IPv6 literals.
pub fn parse_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
  let authority = authority.trim();
  if authority.is_empty() {
    return None;
  }
  let uri = authority.parse::<http::uri::Authority>().ok()?;
  let port = uri.port_u16().unwrap_or(default_port);
  Some((strip_brackets(uri.host()), port))
}

fn strip_brackets(host: &str) -> String {
  host
    .strip_prefix('[')
    .and_then(|h| h.strip_suffix(']'))
    .unwrap_or(host)
    .to_string()
}

/// Decodes requests from a client connection.
#[derive(Debug)]
pub struct RequestReader<R> {
  reader: R,
  max_header_size: usize,
  max_body_size: usize,
}

impl<R: AsyncBufRead + Unpin> RequestReader<R> {
  /// Reader with the default header size limit.
  pub fn new(reader: R) -> Self {
    RequestReader {
      reader,
      max_header_size: DEFAULT_MAX_HEADER_SIZE,
      max_body_size: DEFAULT_MAX_BODY_SIZE,
    }
  }

  /// Override the header size limit
  pub fn max_header_size(mut self, max_header_size: usize) -> Self {
    self.max_header_size = max_header_size;
    self
  }

  /// Override the body size limit
  pub fn max_body_size(mut self, max_body_size: usize) -> Self {
    self.max_body_size = max_body_size;
    self
  }

  /// Read the next request. `None` means the client closed cleanly between
  /// requests.
  pub async fn read(mut self) -> Result<Option<Request>> {
    let Some((line, headers)) = read_head(&mut self.reader, self.max_header_size).await? else {
      return Ok(None);
    };
    let mut parts = line.splitn(3, |b| b == &b' ');
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
      return Err(Error::invalid_request(format!(
        "malformed request line: {}",
        line.escape_ascii()
      )));
    };
    let method = Method::from_bytes(method).map_err(http::Error::from)?;
    let uri = Uri::try_from(target).map_err(http::Error::from)?;
    let version = parse_version(version)?;
    let body = match framing(&headers)? {
      Some(framing) => read_body(&mut self.reader, framing, self.max_body_size).await?,
      None => Bytes::new(),
    };
    if method == Method::CONNECT && uri.authority().is_none() {
      return Err(new_io_error(ErrorKind::InvalidData, "CONNECT without authority"));
    }
    Ok(Some(Request {
      uri,
      version,
      method,
      headers,
      body,
    }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  async fn decode(raw: &'static [u8]) -> Result<Option<Request>> {
    let mut reader = BufReader::new(raw);
    RequestReader::new(&mut reader).read().await
  }

  #[tokio::test]
  async fn absolute_form_is_rewritten() {
    let req = decode(
      b"GET http://example.com:8080/a?b=1 HTTP/1.1\r\nProxy-Connection: keep-alive\r\nProxy-Authorization: Basic eA==\r\n\r\n",
    )
    .await
    .unwrap()
    .unwrap();
    assert!(req.is_absolute_form());
    assert_eq!(req.authority(80), Some(("example.com".to_string(), 8080)));
    let raw = String::from_utf8(req.to_raw().to_vec()).unwrap();
    assert!(raw.starts_with("GET /a?b=1 HTTP/1.1\r\nhost: example.com:8080\r\n"));
    assert!(!raw.contains("proxy-"));
  }

  #[tokio::test]
  async fn origin_form_uses_host_header() {
    let req = decode(b"GET /foo HTTP/1.1\r\nHost: [::1]:9000\r\n\r\n")
      .await
      .unwrap()
      .unwrap();
    assert!(!req.is_absolute_form());
    assert_eq!(req.path(), "/foo");
    assert_eq!(req.authority(80), Some(("::1".to_string(), 9000)));
  }

  #[tokio::test]
  async fn chunked_request_body_gets_content_length() {
    let req = decode(
      b"POST /upload HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(req.body().as_ref(), b"abc");
    let raw = String::from_utf8(req.to_raw().to_vec()).unwrap();
    assert!(raw.contains("content-length: 3\r\n"));
    assert!(!raw.contains("transfer-encoding"));
  }

  #[tokio::test]
  async fn oversized_request_bodies_are_rejected() {
    let err = decode(
      b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabc\r\n0\r\n\r\n",
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    let mut reader = BufReader::new(&b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 99999999999\r\n\r\n"[..]);
    let err = RequestReader::new(&mut reader)
      .max_body_size(1024)
      .read()
      .await
      .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
  }

  #[tokio::test]
  async fn connect_target_is_authority_form() {
    let req = decode(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(req.method(), Method::CONNECT);
    assert_eq!(req.authority(443), Some(("example.com".to_string(), 443)));
  }

  #[tokio::test]
  async fn clean_close_and_garbage() {
    assert!(decode(b"").await.unwrap().is_none());
    assert!(decode(b"GET /\r\n\r\n").await.is_err());
  }

  #[tokio::test]
  async fn pipelined_requests_are_read_in_order() {
    let mut reader = BufReader::new(
      &b"GET /one HTTP/1.1\r\nHost: a\r\n\r\nGET /two HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n"[..],
    );
    let first = RequestReader::new(&mut reader).read().await.unwrap().unwrap();
    let second = RequestReader::new(&mut reader).read().await.unwrap().unwrap();
    assert_eq!(first.path(), "/one");
    assert!(first.keep_alive());
    assert_eq!(second.path(), "/two");
    assert!(!second.keep_alive());
  }

  #[test]
  fn host_port_parsing() {
    assert_eq!(parse_host_port("Example.com", 80), Some(("Example.com".to_string(), 80)));
    assert_eq!(parse_host_port("localhost:1", 80), Some(("localhost".to_string(), 1)));
    assert_eq!(parse_host_port("", 80), None);
  }
}
