//! Proxy configuration

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Credentials clients must present in `Proxy-Authorization`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxyAuth {
  /// user name
  pub username: String,
  /// password
  pub password: String,
}

impl ProxyAuth {
  /// Credentials from a user name and password
  pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
    Self {
      username: username.into(),
      password: password.into(),
    }
  }

  /// The `Basic ...` header value these credentials encode to
  pub fn header_value(&self) -> String {
    format!(
      "Basic {}",
      BASE64_STANDARD.encode(format!("{}:{}", self.username, self.password))
    )
  }

  /// Whether a `Proxy-Authorization` value carries these credentials
  pub fn matches(&self, header: Option<&http::HeaderValue>) -> bool {
    let Some(value) = header.and_then(|v| v.to_str().ok()) else {
      return false;
    };
    let Some((scheme, token)) = value.trim().split_once(' ') else {
      return false;
    };
    if !scheme.eq_ignore_ascii_case("basic") {
      return false;
    }
    BASE64_STANDARD
      .decode(token.trim())
      .ok()
      .and_then(|decoded| String::from_utf8(decoded).ok())
      .map(|decoded| decoded == format!("{}:{}", self.username, self.password))
      .unwrap_or(false)
  }
}

/// Configuration for a proxy instance
///
/// Every field has a default, so a config file only needs to name what it
/// changes. `local_port` has no usable default and must be set.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  /// Port to listen on. `0` picks an ephemeral port.
  pub local_port: Option<u16>,
  /// Fixed upstream host. Present together with `remote_port` for a
  /// reverse proxy.
  pub remote_host: Option<String>,
  /// Fixed upstream port
  pub remote_port: Option<u16>,
  /// Address the listener binds to
  pub bind_address: IpAddr,
  /// Terminate TLS inside CONNECT tunnels instead of relaying them opaquely
  pub intercept_connect: bool,
  /// Forward requests no expectation matched. When off they get `404`.
  pub forward_unmatched: bool,
  /// Verify upstream certificates
  pub verify_upstream_certs: bool,
  /// Upstream connect timeout, in milliseconds
  pub connect_timeout: u64,
  /// Idle read timeout for clients and upstreams alike, in milliseconds
  pub read_timeout: u64,
  /// How long stop waits for in-flight connections, in milliseconds
  pub shutdown_grace: u64,
  /// Maximum concurrent connections
  pub max_connections: usize,
  /// Limit on a request or status line plus headers, in bytes
  pub max_header_size: usize,
  /// Limit on a decoded request or response body, in bytes
  pub max_body_size: usize,
  /// PEM file of a CA certificate to sign intercepted hosts with
  pub ca_cert_path: Option<PathBuf>,
  /// PEM file of the CA private key
  pub ca_key_path: Option<PathBuf>,
  /// Certificate hostname for TLS clients that send no SNI
  pub default_tls_host: String,
  /// Require proxy authentication on CONNECT and absolute-form requests
  pub proxy_auth: Option<ProxyAuth>,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      local_port: None,
      remote_host: None,
      remote_port: None,
      bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
      intercept_connect: true,
      forward_unmatched: true,
      verify_upstream_certs: false,
      connect_timeout: 10_000,
      read_timeout: 30_000,
      shutdown_grace: 2000,
      max_connections: 1000,
      max_header_size: crate::response::DEFAULT_MAX_HEADER_SIZE,
      max_body_size: crate::response::DEFAULT_MAX_BODY_SIZE,
      ca_cert_path: None,
      ca_key_path: None,
      default_tls_host: "localhost".to_string(),
      proxy_auth: None,
    }
  }
}

impl ProxyConfig {
  /// Upstream connect timeout
  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout)
  }
  /// Idle read timeout
  pub fn read_timeout(&self) -> Duration {
    Duration::from_millis(self.read_timeout)
  }
  /// Stop grace period
  pub fn shutdown_grace(&self) -> Duration {
    Duration::from_millis(self.shutdown_grace)
  }
}
