//! Error types for proxymock
use std::io;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `proxymock::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The Errors that may occur while building, running or talking to a proxy.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Invalid or incomplete configuration, fatal to `ProxyBuilder::build`
  #[error("Configuration error: {0}")]
  Config(String),

  /// Lifecycle error (bind in use, starting a running instance)
  #[error("Lifecycle error: {0}")]
  Lifecycle(String),

  /// The peer speaks a protocol that could not be classified
  #[error("Protocol error: {0}")]
  Protocol(String),

  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// TLS handshake or configuration error
  #[error("TLS error: {0}")]
  Tls(String),

  /// Certificate issuance error
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// HTTP message construction error
  #[error("HTTP error: {0}")]
  Http(http::Error),

  /// Malformed request received from a client
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Upstream connect or relay failure
  #[error("Connection error: {0}")]
  Connection(String),

  /// SOCKS reply sent to a client when a tunnel could not be established
  #[error(transparent)]
  Reply(#[from] ReplyError),
}

/// SOCKS failure replies, mapped to their wire codes by [`ReplyError::code`].
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
  /// General failure
  #[error("General failure")]
  GeneralFailure,
  /// Network unreachable
  #[error("Network unreachable")]
  NetworkUnreachable,
  /// Host unreachable
  #[error("Host unreachable")]
  HostUnreachable,
  /// Connection refused
  #[error("Connection refused")]
  ConnectionRefused,
  /// Command not supported
  #[error("Command not supported")]
  CommandNotSupported,
  /// Address type not supported
  #[error("Address type not supported")]
  AddressTypeNotSupported,
}

impl ReplyError {
  /// SOCKS5 `REP` code for this failure.
  pub fn code(&self) -> u8 {
    match self {
      ReplyError::GeneralFailure => 0x01,
      ReplyError::NetworkUnreachable => 0x03,
      ReplyError::HostUnreachable => 0x04,
      ReplyError::ConnectionRefused => 0x05,
      ReplyError::CommandNotSupported => 0x07,
      ReplyError::AddressTypeNotSupported => 0x08,
    }
  }

  /// Pick the reply that best describes a failed upstream connect.
  pub fn from_connect_error(error: &io::Error) -> Self {
    match error.kind() {
      io::ErrorKind::ConnectionRefused => ReplyError::ConnectionRefused,
      io::ErrorKind::TimedOut | io::ErrorKind::NotFound => ReplyError::HostUnreachable,
      _ => ReplyError::GeneralFailure,
    }
  }
}

impl Error {
  /// Create a configuration error and log it
  pub fn config(msg: impl Into<String>) -> Self {
    let error = Error::Config(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a lifecycle error and log it
  pub fn lifecycle(msg: impl Into<String>) -> Self {
    let error = Error::Lifecycle(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a protocol error and log it
  pub fn protocol(msg: impl Into<String>) -> Self {
    let error = Error::Protocol(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::warn!("{}", error);
    error
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    tracing::debug!("IO error: {}", value);
    Error::Io(value)
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<tokio_rustls::rustls::Error> for Error {
  fn from(value: tokio_rustls::rustls::Error) -> Self {
    Error::tls_error(value.to_string())
  }
}

pub(crate) fn new_io_error(error_kind: io::ErrorKind, msg: &str) -> Error {
  Error::Io(io::Error::new(error_kind, msg))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn connect_failures_map_to_socks_replies() {
    let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
    assert_eq!(ReplyError::from_connect_error(&refused).code(), 0x05);
    let timeout = io::Error::from(io::ErrorKind::TimedOut);
    assert_eq!(ReplyError::from_connect_error(&timeout).code(), 0x04);
    let other = io::Error::from(io::ErrorKind::BrokenPipe);
    assert_eq!(ReplyError::from_connect_error(&other).code(), 0x01);
  }

  #[test]
  fn config_error_message_names_the_problem() {
    let err = Error::config("local port was never specified");
    assert!(err.to_string().contains("local port"));
  }
}
