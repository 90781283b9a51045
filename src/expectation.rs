//! Canned responses for requests the proxy should answer itself

use crate::errors::Result;
use crate::{Request, Response};
use http::Method;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Decides whether a decoded request is answered locally.
#[async_trait::async_trait]
pub trait ExpectationMatcher: Send + Sync {
  /// Return the mock response for `request`, or `None` to let it go
  /// upstream.
  async fn respond(&self, request: &Request) -> Result<Option<Response>>;
}

/// A method/path (and optionally host) pair mapped to a fixed response.
#[derive(Debug, Clone)]
pub struct Expectation {
  method: Option<Method>,
  path: String,
  host: Option<String>,
  response: Response,
}

impl Expectation {
  /// Match any method on `path`, answering `200 OK` with an empty body until
  /// [`Expectation::respond_with`] says otherwise.
  pub fn new(path: impl Into<String>) -> Self {
    Self {
      method: None,
      path: path.into(),
      host: None,
      response: Response::from(
        http::Response::builder()
          .status(http::StatusCode::OK)
          .body(bytes::Bytes::new())
          .unwrap_or_default(),
      ),
    }
  }

  /// Only match `method`
  pub fn method(mut self, method: Method) -> Self {
    self.method = Some(method);
    self
  }

  /// Only match requests addressed to `host` (case-insensitive, port ignored)
  pub fn host(mut self, host: impl Into<String>) -> Self {
    self.host = Some(host.into().to_ascii_lowercase());
    self
  }

  /// Response to send back
  pub fn respond_with(mut self, response: impl Into<Response>) -> Self {
    self.response = response.into();
    self
  }

  /// Whether `request` hits this expectation
  pub fn matches(&self, request: &Request) -> bool {
    if let Some(method) = &self.method {
      if method != request.method() {
        return false;
      }
    }
    if let Some(host) = &self.host {
      if request.host().as_deref() != Some(host.as_str()) {
        return false;
      }
    }
    request.path() == self.path
  }
}

#[async_trait::async_trait]
impl ExpectationMatcher for Expectation {
  async fn respond(&self, request: &Request) -> Result<Option<Response>> {
    Ok(self.matches(request).then(|| self.response.clone()))
  }
}

/// Ordered list of matchers; the first one that answers wins.
#[derive(Default)]
pub struct Expectations {
  matchers: RwLock<Vec<Arc<dyn ExpectationMatcher>>>,
}

impl Expectations {
  /// Empty store
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a matcher after the existing ones
  pub async fn add(&self, matcher: impl ExpectationMatcher + 'static) {
    self.matchers.write().await.push(Arc::new(matcher));
  }

  /// Append an already shared matcher
  pub async fn add_shared(&self, matcher: Arc<dyn ExpectationMatcher>) {
    self.matchers.write().await.push(matcher);
  }

  /// Remove every matcher
  pub async fn clear(&self) {
    self.matchers.write().await.clear();
  }

  /// Number of matchers
  pub async fn len(&self) -> usize {
    self.matchers.read().await.len()
  }

  /// Whether no matcher is installed
  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }

  /// Ask each matcher in order.
  pub async fn respond(&self, request: &Request) -> Result<Option<Response>> {
    let matchers = self.matchers.read().await.clone();
    for matcher in matchers {
      if let Some(response) = matcher.respond(request).await? {
        return Ok(Some(response));
      }
    }
    Ok(None)
  }
}
