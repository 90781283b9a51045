use crate::errors::{new_io_error, Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, Response as HttpResponse, StatusCode, Version};
use std::io::ErrorKind;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Default cap on the request/status line plus header block, in bytes.
pub const DEFAULT_MAX_HEADER_SIZE: usize = 64 * 1024;

/// Default cap on a decoded message body, in bytes.
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// An HTTP/1.x response, either decoded from an upstream or produced by an
/// expectation.
#[derive(Debug, Default, Clone)]
pub struct Response {
  version: Version,
  status_code: StatusCode,
  headers: HeaderMap<HeaderValue>,
  body: Bytes,
  bodiless: bool,
}

impl PartialEq for Response {
  fn eq(&self, other: &Self) -> bool {
    self.version == other.version
      && self.status_code == other.status_code
      && self.headers == other.headers
      && self.body == other.body
  }
}

impl<T> From<HttpResponse<T>> for Response
where
  T: Into<Bytes>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    Self {
      version: parts.version,
      status_code: parts.status,
      headers: parts.headers,
      body: body.into(),
      bodiless: status_forbids_body(parts.status),
    }
  }
}

impl Response {
  /// An HTTP response builder
  ///
  /// This type can be used to construct an instance of `Response` through a
  /// builder-like pattern.
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }

  /// A small `text/plain` response whose body is the status' reason phrase.
  pub fn status_only(status_code: StatusCode) -> Response {
    let reason = status_code.canonical_reason().unwrap_or("");
    let mut headers = HeaderMap::new();
    headers.insert(
      header::CONTENT_TYPE,
      HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    Response {
      version: Version::HTTP_11,
      status_code,
      headers,
      body: Bytes::from(reason.to_string()),
      bodiless: false,
    }
  }

  /// Encode with normalized framing.
  ///
  /// `Transfer-Encoding` is dropped and `Content-Length` describes the
  /// decoded body, unless the response carries no body at all (HEAD, 1xx,
  /// 204, 304) in which case the headers are written untouched.
  pub fn to_raw(&self) -> Bytes {
    let mut http_response = Vec::new();
    http_response.extend(version_str(self.version).as_bytes());
    http_response.extend(SPACE);
    http_response.extend(self.status_code.as_str().as_bytes());
    http_response.extend(SPACE);
    http_response.extend(
      self
        .status_code
        .canonical_reason()
        .unwrap_or("Unknown")
        .as_bytes(),
    );
    http_response.extend(CR_LF);
    let mut headers = self.headers.clone();
    if !self.bodiless {
      headers.remove(header::TRANSFER_ENCODING);
      headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.body.len()));
    }
    for (k, v) in headers.iter() {
      http_response.extend(k.as_str().as_bytes());
      http_response.extend(COLON_SPACE);
      http_response.extend(v.as_bytes());
      http_response.extend(CR_LF);
    }
    http_response.extend(CR_LF);
    if !self.bodiless {
      http_response.extend(self.body.as_ref());
    }
    Bytes::from(http_response)
  }

  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> StatusCode {
    self.status_code
  }
  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Get the `Headers` of this `Response`.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the `Headers` of this `Response`.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Decoded body
  pub fn body(&self) -> &Bytes {
    &self.body
  }
  /// Body decoded as UTF-8, lossily
  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).to_string()
  }
  /// Get the content-length header, if present.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok())
  }
  /// Whether the connection may carry another exchange after this one.
  pub fn keep_alive(&self) -> bool {
    keep_alive(self.version, &self.headers)
  }

  /// Whether the upstream connection that produced this response can be
  /// reused: it must be kept alive and the body must have been delimited.
  pub(crate) fn reusable_connection(&self) -> bool {
    self.keep_alive() && (self.bodiless || matches!(framing(&self.headers), Ok(Some(_))))
  }
}

/// Decodes one response from an upstream.
///
/// The reader is borrowed so the caller can keep using the connection for
/// the next exchange.
#[derive(Debug)]
pub struct ResponseReader<R> {
  reader: R,
  method: Method,
  max_header_size: usize,
  max_body_size: usize,
}

impl<R: AsyncBufRead + Unpin> ResponseReader<R> {
  /// Reader for the response to a request sent with `method`.
  pub fn new(reader: R, method: &Method) -> Self {
    ResponseReader {
      reader,
      method: method.clone(),
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

  /// Read and decode the response, skipping interim `1xx` responses.
  pub async fn read(mut self) -> Result<Response> {
    loop {
      let Some((line, headers)) = read_head(&mut self.reader, self.max_header_size).await? else {
        return Err(new_io_error(
          ErrorKind::UnexpectedEof,
          "connection closed before a response was received",
        ));
      };
      let (version, status_code) = parse_status_line(&line)?;
      if status_code.is_informational() && status_code != StatusCode::SWITCHING_PROTOCOLS {
        continue;
      }
      let bodiless = self.method == Method::HEAD || status_forbids_body(status_code);
      let body = if bodiless {
        Bytes::new()
      } else {
        match framing(&headers)? {
          Some(framing) => read_body(&mut self.reader, framing, self.max_body_size).await?,
          None => {
            let mut body = Vec::new();
            (&mut self.reader)
              .take(self.max_body_size as u64 + 1)
              .read_to_end(&mut body)
              .await?;
            if body.len() > self.max_body_size {
              return Err(body_too_large(self.max_body_size));
            }
            Bytes::from(body)
          }
        }
      };
      return Ok(Response {
        version,
        status_code,
        headers,
        body,
        bodiless,
      });
    }
  }
}

fn status_forbids_body(status_code: StatusCode) -> bool {
  status_code.is_informational()
    || status_code == StatusCode::NO_CONTENT
    || status_code == StatusCode::NOT_MODIFIED
}

fn parse_status_line(line: &[u8]) -> Result<(Version, StatusCode)> {
  let mut parts = line.splitn(3, |b| b == &b' ');
  let version = parse_version(parts.next().unwrap_or_default())?;
  let code = parts.next().unwrap_or_default();
  let status_code = StatusCode::from_bytes(code).map_err(|x| Error::Http(http::Error::from(x)))?;
  Ok((version, status_code))
}

pub(crate) fn version_str(version: Version) -> &'static str {
  if version == Version::HTTP_10 {
    "HTTP/1.0"
  } else {
    "HTTP/1.1"
  }
}

pub(crate) fn parse_version(token: &[u8]) -> Result<Version> {
  match token {
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    _ => Err(new_io_error(ErrorKind::InvalidData, "invalid http version")),
  }
}

pub(crate) fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
  let connection = headers
    .get_all(header::CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|v| v.trim().to_ascii_lowercase())
    .collect::<Vec<_>>();
  if connection.iter().any(|v| v == "close") {
    return false;
  }
  version != Version::HTTP_10 || connection.iter().any(|v| v == "keep-alive")
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
  Length(u64),
  Chunked,
}

/// `None` means no framing header was present.
pub(crate) fn framing(headers: &HeaderMap) -> Result<Option<Framing>> {
  if let Some(te) = headers.get(header::TRANSFER_ENCODING) {
    let chunked = te
      .to_str()
      .map(|v| v.to_ascii_lowercase().contains("chunked"))
      .unwrap_or(false);
    if chunked {
      return Ok(Some(Framing::Chunked));
    }
  }
  match headers.get(header::CONTENT_LENGTH) {
    Some(v) => {
      let length = v
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| Error::invalid_request("invalid content-length"))?;
      Ok(Some(Framing::Length(length)))
    }
    None => Ok(None),
  }
}

fn body_too_large(max_body_size: usize) -> Error {
  Error::invalid_request(format!("body exceeds size limit of {} bytes", max_body_size))
}

pub(crate) async fn read_body<R>(reader: &mut R, framing: Framing, max_body_size: usize) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  match framing {
    Framing::Length(0) => Ok(Bytes::new()),
    Framing::Length(length) => {
      if length > max_body_size as u64 {
        return Err(body_too_large(max_body_size));
      }
      let mut body = Vec::new();
      let read = (&mut *reader).take(length).read_to_end(&mut body).await?;
      if (read as u64) < length {
        return Err(new_io_error(ErrorKind::UnexpectedEof, "body shorter than content-length"));
      }
      Ok(Bytes::from(body))
    }
    Framing::Chunked => read_chunked_body(reader, max_body_size).await,
  }
}

async fn read_chunked_body<R>(reader: &mut R, max_body_size: usize) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    if reader.read_until(b'\n', &mut line).await? == 0 {
      return Err(new_io_error(ErrorKind::UnexpectedEof, "truncated chunked body"));
    }
    let size = trim_line(&line);
    let size = size.split(|b| b == &b';').next().unwrap_or_default();
    let size = std::str::from_utf8(size)
      .ok()
      .and_then(|s| u64::from_str_radix(s.trim(), 16).ok())
      .ok_or_else(|| new_io_error(ErrorKind::InvalidData, "invalid chunk size"))?;
    if size == 0 {
      // trailers, up to the terminating empty line
      loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 || trim_line(&line).is_empty() {
          break;
        }
      }
      return Ok(Bytes::from(body));
    }
    match (body.len() as u64).checked_add(size) {
      Some(total) if total <= max_body_size as u64 => {}
      _ => return Err(body_too_large(max_body_size)),
    }
    let read = (&mut *reader).take(size).read_to_end(&mut body).await?;
    if (read as u64) < size {
      return Err(new_io_error(ErrorKind::UnexpectedEof, "truncated chunk"));
    }
    line.clear();
    reader.read_until(b'\n', &mut line).await?;
  }
}

/// Read the start line and header block.
///
/// Returns `None` on a clean close before the first byte. Leading empty
/// lines are skipped.
pub(crate) async fn read_head<R>(
  reader: &mut R,
  max_header_size: usize,
) -> Result<Option<(Vec<u8>, HeaderMap)>>
where
  R: AsyncBufRead + Unpin,
{
  let mut budget = max_header_size;
  let mut start_line = Vec::new();
  loop {
    start_line.clear();
    if read_limited_line(reader, &mut start_line, &mut budget).await? == 0 {
      return Ok(None);
    }
    if !trim_line(&start_line).is_empty() {
      break;
    }
  }
  let start_line = trim_line(&start_line).to_vec();
  let mut headers = HeaderMap::new();
  let mut header_line = Vec::new();
  loop {
    header_line.clear();
    if read_limited_line(reader, &mut header_line, &mut budget).await? == 0 {
      return Err(new_io_error(ErrorKind::UnexpectedEof, "truncated header block"));
    }
    let line = trim_line(&header_line);
    if line.is_empty() {
      break;
    }
    if let Ok((Some(k), Some(v))) = parser_headers(line) {
      headers.append(k, v);
    }
  }
  Ok(Some((start_line, headers)))
}

async fn read_limited_line<R>(reader: &mut R, buf: &mut Vec<u8>, budget: &mut usize) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  let read = (&mut *reader)
    .take(*budget as u64)
    .read_until(b'\n', buf)
    .await?;
  *budget -= read;
  if read > 0 && !buf.ends_with(b"\n") {
    if *budget == 0 {
      return Err(Error::invalid_request("header block exceeds size limit"));
    }
    return Err(new_io_error(ErrorKind::UnexpectedEof, "truncated header line"));
  }
  Ok(read)
}

fn trim_line(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}

pub(crate) fn parser_headers(
  buffer: &[u8],
) -> Result<(Option<http::HeaderName>, Option<http::HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  for (index, h) in buffer.splitn(2, |s| s == &b':').enumerate() {
    let h = h.trim_ascii();
    match index {
      0 => k = Some(http::HeaderName::from_bytes(h).map_err(http::Error::from)?),
      1 => v = Some(http::HeaderValue::from_bytes(h).map_err(http::Error::from)?),
      _ => {}
    }
  }
  Ok((k, v))
}
