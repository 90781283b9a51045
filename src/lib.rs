#![deny(missing_docs)]

//! # proxymock
//!
//! A programmable intermediary on a single TCP port that is at once
//!
//! - a mock HTTP/HTTPS server answering configured [expectations](Expectation),
//! - a forward proxy for HTTP, `CONNECT` (relayed or TLS-intercepted) and
//!   SOCKS4/4a/5,
//! - a reverse proxy sending everything unmatched to one fixed upstream.
//!
//! Clients never say which role they want. The first bytes of every
//! connection are [sniffed](sniff) and the matching handler chain is
//! installed for it.
//!
//! ## Forward proxy with TLS interception
//!
//! ```rust,no_run
//! # async fn run() -> proxymock::Result<()> {
//! use proxymock::{Expectation, ProxyBuilder};
//!
//! let proxy = ProxyBuilder::new().local_port(1080).start().await?;
//! proxy
//!   .expectations()
//!   .add(Expectation::new("/health").respond_with(
//!     proxymock::http::Response::builder().status(200).body("ok").unwrap(),
//!   ))
//!   .await;
//! // clients trust this root to accept intercepted certificates
//! let _root = proxy.ca_cert_pem();
//! for record in proxy.log().snapshot() {
//!   println!("{} {}", record.request.method(), record.response.status_code());
//! }
//! proxy.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Reverse proxy
//!
//! ```rust,no_run
//! # async fn run() -> proxymock::Result<()> {
//! let proxy = proxymock::ProxyBuilder::new()
//!   .local_port(8080)
//!   .remote("backend.internal", 80)
//!   .start()
//!   .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Remote control
//!
//! Every instance answers `PUT /proxymock/status`, `/reset` and `/stop`
//! itself; [`ProxyClient`] wraps them behind the same [`ProxyLifecycle`]
//! trait the local [`ProxyServer`] implements.
//!
//! The crate logs through `tracing` and never installs a subscriber.

mod ca;
mod client;
mod config;
mod connector;
/// Per-connection protocol dispatch
pub mod dispatcher;
mod errors;
mod expectation;
mod proxy;
/// record info
pub mod record;
mod relay;
mod request;
mod response;
mod server;
mod session;
/// Protocol sniffing
pub mod sniff;
mod socket;
/// SOCKS handshakes
pub mod socks5;
mod tls;
mod tunnel;

pub use ca::{CertificateAuthority, CertificateBinding, CertificateManager, CertificateProvider};
pub use client::{ProxyClient, Status};
pub use config::{ProxyAuth, ProxyConfig};
pub use connector::{Connector, ConnectorBuilder};
pub use errors::{Error, ReplyError, Result};
pub use expectation::{Expectation, ExpectationMatcher, Expectations};
pub use http;
pub use http::header;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use proxy::{ProxyBuilder, ProxyMode, Upstream};
pub use relay::relay;
pub use request::{parse_host_port, Request, RequestReader};
pub use response::{Response, ResponseReader, DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_HEADER_SIZE};
pub use server::{ProxyLifecycle, ProxyServer, RunState};
pub use socket::{BoxedIo, Io, PrefixedStream, Socket};
pub use tls::Certificate;
pub use tokio_rustls::rustls;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
