//! Integration tests for proxymock, driving real sockets on 127.0.0.1

use bytes::Bytes;
use proxymock::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use proxymock::rustls::{ClientConfig, RootCertStore, ServerConfig};
use proxymock::{
  CertificateAuthority, CertificateProvider, Error, Expectation, ProxyBuilder, ProxyClient,
  ProxyLifecycle, ProxyServer, RunState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn provider() -> Arc<proxymock::rustls::crypto::CryptoProvider> {
  Arc::new(proxymock::rustls::crypto::ring::default_provider())
}

// RUST_LOG=proxymock=debug shows the proxy side of a failing test
fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

fn local() -> ProxyBuilder {
  init_tracing();
  ProxyBuilder::new()
    .local_port(0)
    .bind_address("127.0.0.1".parse().unwrap())
}

fn free_port() -> u16 {
  std::net::TcpListener::bind("127.0.0.1:0")
    .unwrap()
    .local_addr()
    .unwrap()
    .port()
}

async fn connect(proxy: &ProxyServer) -> TcpStream {
  TcpStream::connect(("127.0.0.1", proxy.local_port()))
    .await
    .unwrap()
}

/// Read up to and including the blank line ending a header block.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
  let mut head = Vec::new();
  while !head.ends_with(b"\r\n\r\n") {
    head.push(stream.read_u8().await.unwrap());
  }
  String::from_utf8(head).unwrap()
}

async fn read_all<S: AsyncRead + Unpin>(stream: &mut S) -> String {
  let mut out = Vec::new();
  // a TLS peer may skip close_notify; what arrived is all we need
  let _ = stream.read_to_end(&mut out).await;
  String::from_utf8_lossy(&out).to_string()
}

async fn echo_server() -> u16 {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        let (mut r, mut w) = stream.split();
        let _ = tokio::io::copy(&mut r, &mut w).await;
      });
    }
  });
  port
}

/// Serve one response per connection and report each request head.
async fn serve_http<S>(mut stream: S, body: &'static str, seen: mpsc::UnboundedSender<String>)
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let head = read_head(&mut stream).await;
  let _ = seen.send(head);
  let response = format!(
    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
    body.len(),
    body
  );
  let _ = stream.write_all(response.as_bytes()).await;
  let _ = stream.shutdown().await;
}

async fn http_upstream(body: &'static str) -> (u16, mpsc::UnboundedReceiver<String>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  let (tx, rx) = mpsc::unbounded_channel();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      tokio::spawn(serve_http(stream, body, tx.clone()));
    }
  });
  (port, rx)
}

fn tls_acceptor() -> TlsAcceptor {
  let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
  let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.signing_key.serialize_der()));
  let config = ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert.cert.der().clone()], key)
    .unwrap();
  TlsAcceptor::from(Arc::new(config))
}

async fn tls_upstream(body: &'static str) -> (u16, mpsc::UnboundedReceiver<String>) {
  let acceptor = tls_acceptor();
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  let (tx, rx) = mpsc::unbounded_channel();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      let tx = tx.clone();
      tokio::spawn(async move {
        if let Ok(stream) = acceptor.accept(stream).await {
          serve_http(stream, body, tx).await;
        }
      });
    }
  });
  (port, rx)
}

async fn try_read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Option<String> {
  let mut head = Vec::new();
  while !head.ends_with(b"\r\n\r\n") {
    head.push(stream.read_u8().await.ok()?);
  }
  String::from_utf8(head).ok()
}

/// Answer `ok` with keep-alive until the connection idles for `idle`.
async fn serve_keep_alive<S>(mut stream: S, idle: Duration)
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  loop {
    let head = tokio::time::timeout(idle, try_read_head(&mut stream)).await;
    if !matches!(head, Ok(Some(_))) {
      break;
    }
    let answer = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
    if stream.write_all(answer).await.is_err() || stream.flush().await.is_err() {
      return;
    }
  }
  let _ = stream.shutdown().await;
}

/// Keep-alive upstream; the counter tracks accepted connections.
async fn keep_alive_upstream(idle: Duration, tls: Option<TlsAcceptor>) -> (u16, Arc<AtomicUsize>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  let accepted = Arc::new(AtomicUsize::new(0));
  let counter = accepted.clone();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      counter.fetch_add(1, Ordering::SeqCst);
      let tls = tls.clone();
      tokio::spawn(async move {
        match tls {
          Some(acceptor) => {
            if let Ok(stream) = acceptor.accept(stream).await {
              serve_keep_alive(stream, idle).await;
            }
          }
          None => serve_keep_alive(stream, idle).await,
        }
      });
    }
  });
  (port, accepted)
}

/// Read one `ok` response off a kept-alive connection.
async fn read_ok<S: AsyncRead + Unpin>(stream: &mut S) -> String {
  let head = read_head(stream).await;
  let mut body = [0u8; 2];
  stream.read_exact(&mut body).await.unwrap();
  assert_eq!(&body, b"ok");
  head
}

/// Open an intercepted tunnel to `host:port` and finish the TLS handshake.
async fn intercepted_tunnel(
  proxy: &ProxyServer,
  host: &str,
  port: u16,
) -> std::io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
  let mut stream = connect(proxy).await;
  let connect = format!("CONNECT {0}:{1} HTTP/1.1\r\nHost: {0}:{1}\r\n\r\n", host, port);
  stream.write_all(connect.as_bytes()).await.unwrap();
  assert_eq!(
    read_head(&mut stream).await,
    "HTTP/1.1 200 Connection established\r\n\r\n"
  );
  client_trusting(proxy.ca_cert_der())
    .connect(ServerName::try_from(host.to_string()).unwrap(), stream)
    .await
}

/// Signs nothing; every issuance fails.
struct RefusingProvider(CertificateAuthority);

impl CertificateProvider for RefusingProvider {
  fn issue(&self, hostname: &str) -> proxymock::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    Err(Error::certificate_error(format!("refusing to sign {}", hostname)))
  }

  fn ca_cert_der(&self) -> CertificateDer<'static> {
    self.0.ca_cert_der()
  }

  fn ca_cert_pem(&self) -> String {
    self.0.ca_cert_pem()
  }
}

fn client_trusting(root: CertificateDer<'static>) -> TlsConnector {
  let mut roots = RootCertStore::empty();
  roots.add(root).unwrap();
  let config = ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  TlsConnector::from(Arc::new(config))
}

async fn wait_until_stopped(proxy: &ProxyServer) {
  for _ in 0..100 {
    if !proxy.is_running() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  panic!("proxy did not stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_intercepted_connect_reaches_tls_upstream() {
  let (upstream_port, mut seen) = tls_upstream("secret upstream").await;
  let proxy = local().start().await.unwrap();

  let mut stream = connect(&proxy).await;
  let connect = format!(
    "CONNECT localhost:{0} HTTP/1.1\r\nHost: localhost:{0}\r\n\r\n",
    upstream_port
  );
  stream.write_all(connect.as_bytes()).await.unwrap();
  let head = read_head(&mut stream).await;
  assert_eq!(head, "HTTP/1.1 200 Connection established\r\n\r\n");

  let connector = client_trusting(proxy.ca_cert_der());
  let server_name = ServerName::try_from("localhost").unwrap();
  let mut tls = connector
    .connect(server_name, stream)
    .await
    .expect("client should trust the intercepted certificate");
  tls
    .write_all(b"GET /inside HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let response = read_all(&mut tls).await;
  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
  assert!(response.ends_with("secret upstream"));
  assert!(seen.recv().await.unwrap().starts_with("GET /inside HTTP/1.1\r\n"));

  let records = proxy.log().snapshot();
  assert_eq!(records.len(), 1);
  assert!(!records[0].mocked);
  assert_eq!(
    records[0].upstream.as_deref(),
    Some(format!("localhost:{}", upstream_port).as_str())
  );
  proxy.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_relayed_connect_passes_raw_bytes() {
  let echo_port = echo_server().await;
  let proxy = local().intercept_connect(false).start().await.unwrap();

  let mut stream = connect(&proxy).await;
  let connect = format!("CONNECT 127.0.0.1:{0} HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\n\r\n", echo_port);
  stream.write_all(connect.as_bytes()).await.unwrap();
  let head = read_head(&mut stream).await;
  assert!(head.starts_with("HTTP/1.1 200 "));

  let payload = b"\x00\x01not http at all";
  stream.write_all(payload).await.unwrap();
  let mut buf = vec![0u8; payload.len()];
  stream.read_exact(&mut buf).await.unwrap();
  assert_eq!(&buf[..], &payload[..]);
  // opaque tunnels never reach the exchange log
  assert!(proxy.log().is_empty());
  proxy.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_relayed_connect_to_closed_port_is_bad_gateway() {
  let proxy = local().intercept_connect(false).start().await.unwrap();
  let mut stream = connect(&proxy).await;
  let connect = format!("CONNECT 127.0.0.1:{0} HTTP/1.1\r\n\r\n", free_port());
  stream.write_all(connect.as_bytes()).await.unwrap();
  let response = read_all(&mut stream).await;
  assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{response}");
  proxy.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reverse_proxy_forwards_unmatched() {
  let (upstream_port, mut seen) = http_upstream("from backend").await;
  let proxy = local()
    .remote("127.0.0.1", upstream_port)
    .start()
    .await
    .unwrap();
  assert!(proxy.mode().is_reverse());

  let mut stream = connect(&proxy).await;
  stream
    .write_all(b"GET /foo HTTP/1.1\r\nHost: mock.local\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let response = read_all(&mut stream).await;
  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(response.ends_with("from backend"));
  let head = seen.recv().await.unwrap();
  assert!(head.starts_with("GET /foo HTTP/1.1\r\n"));
  assert!(head.contains("host: mock.local\r\n"));
  proxy.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_socks5_connect_is_relayed() {
  let echo_port = echo_server().await;
  let proxy = local().start().await.unwrap();

  let mut stream = connect(&proxy).await;
  stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
  let mut method = [0u8; 2];
  stream.read_exact(&mut method).await.unwrap();
  assert_eq!(method, [0x05, 0x00]);

  let [hi, lo] = echo_port.to_be_bytes();
  stream
    .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, hi, lo])
    .await
    .unwrap();
  let mut reply = [0u8; 10];
  stream.read_exact(&mut reply).await.unwrap();
  assert_eq!(&reply[..2], &[0x05, 0x00]);

  stream.write_all(b"socks!").await.unwrap();
  let mut buf = [0u8; 6];
  stream.read_exact(&mut buf).await.unwrap();
  assert_eq!(&buf, b"socks!");
  proxy.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_socks5_refused_target_gets_failure_reply() {
  let proxy = local().start().await.unwrap();
  let mut stream = connect(&proxy).await;
  stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
  let mut method = [0u8; 2];
  stream.read_exact(&mut method).await.unwrap();
  let [hi, lo] = free_port().to_be_bytes();
  stream
    .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, hi, lo])
    .await
    .unwrap();
  let mut reply = [0u8; 10];
  stream.read_exact(&mut reply).await.unwrap();
  // connection refused
  assert_eq!(reply[1], 0x05);
  proxy.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reverse_proxy_closes_socks() {
  let proxy = local().remote("127.0.0.1", 9).start().await.unwrap();
  let mut stream = connect(&proxy).await;
  stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
  let rest = read_all(&mut stream).await;
  assert!(rest.is_empty());
  proxy.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_bytes_are_closed_silently() {
  let proxy = local().start().await.unwrap();
  let mut stream = connect(&proxy).await;
  stream.write_all(b"\xffhello").await.unwrap();
  assert!(read_all(&mut stream).await.is_empty());
  proxy.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_stop_start_same_port() {
  let port = free_port();
  let proxy = ProxyBuilder::new()
    .local_port(port)
    .bind_address("127.0.0.1".parse().unwrap())
    .build()
    .unwrap();
  let mut states = Vec::new();
  proxy.start().await.unwrap();
  states.push(proxy.is_running());
  proxy.stop().await.unwrap();
  states.push(proxy.is_running());
  proxy.start().await.unwrap();
  states.push(proxy.is_running());
  proxy.stop().await.unwrap();
  states.push(proxy.is_running());
  assert_eq!(states, vec![true, false, true, false]);
  assert_eq!(proxy.local_port(), port);

  // a fresh instance on the same port after a clean stop
  let again = ProxyBuilder::new()
    .local_port(port)
    .bind_address("127.0.0.1".parse().unwrap())
    .start()
    .await
    .unwrap();
  assert!(again.is_running());
  again.stop().await.unwrap();
  again.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_port_in_use_is_a_lifecycle_error() {
  let first = local().start().await.unwrap();
  let second = ProxyBuilder::new()
    .local_port(first.local_port())
    .bind_address("127.0.0.1".parse().unwrap())
    .build()
    .unwrap();
  assert!(matches!(second.start().await, Err(Error::Lifecycle(_))));
  assert_eq!(second.state(), RunState::Stopped);
  assert!(first.is_running());
  first.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_local_port_is_a_config_error() {
  match ProxyBuilder::new().remote("backend", 80).build() {
    Err(Error::Config(msg)) => assert!(msg.contains("local port")),
    other => panic!("expected a config error, got {:?}", other.map(|_| ())),
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mock_answers_plain_and_direct_tls() {
  let proxy = local().default_tls_host("mock.test").start().await.unwrap();
  proxy
    .expectations()
    .add(
      Expectation::new("/mocked")
        .method(proxymock::Method::GET)
        .respond_with(
          proxymock::http::Response::builder()
            .status(200)
            .header("x-mock", "1")
            .body(Bytes::from_static(b"canned"))
            .unwrap(),
        ),
    )
    .await;

  let mut stream = connect(&proxy).await;
  stream
    .write_all(b"GET /mocked HTTP/1.1\r\nHost: anything\r\n\r\nGET /mocked HTTP/1.1\r\nHost: anything\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let response = read_all(&mut stream).await;
  assert_eq!(response.matches("canned").count(), 2);

  let tcp = connect(&proxy).await;
  let mut tls = client_trusting(proxy.ca_cert_der())
    .connect(ServerName::try_from("mock.test").unwrap(), tcp)
    .await
    .unwrap();
  tls
    .write_all(b"GET /mocked HTTP/1.1\r\nHost: mock.test\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let response = read_all(&mut tls).await;
  assert!(response.contains("x-mock: 1\r\n"));

  let records = proxy.log().retrieve(|record| record.mocked);
  assert_eq!(records.len(), 3);
  proxy.reset();
  assert!(proxy.log().is_empty());
  proxy.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forward_to_closed_port_is_bad_gateway() {
  let proxy = local().start().await.unwrap();
  let mut stream = connect(&proxy).await;
  let request = format!(
    "GET http://127.0.0.1:{0}/ HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\nConnection: close\r\n\r\n",
    free_port()
  );
  stream.write_all(request.as_bytes()).await.unwrap();
  let response = read_all(&mut stream).await;
  assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{response}");
  assert_eq!(proxy.log().len(), 1);
  proxy.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forward_proxy_auth() {
  let (upstream_port, _seen) = http_upstream("authorized").await;
  let auth = proxymock::ProxyAuth::new("user", "pass");
  let proxy = local().proxy_auth(auth.clone()).start().await.unwrap();

  let mut stream = connect(&proxy).await;
  let request = format!(
    "GET http://127.0.0.1:{0}/ HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\nConnection: close\r\n\r\n",
    upstream_port
  );
  stream.write_all(request.as_bytes()).await.unwrap();
  let response = read_all(&mut stream).await;
  assert!(response.starts_with("HTTP/1.1 407 "));

  let mut stream = connect(&proxy).await;
  let request = format!(
    "GET http://127.0.0.1:{0}/ HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\nProxy-Authorization: {1}\r\nConnection: close\r\n\r\n",
    upstream_port,
    auth.header_value()
  );
  stream.write_all(request.as_bytes()).await.unwrap();
  let response = read_all(&mut stream).await;
  assert!(response.ends_with("authorized"), "{response}");
  proxy.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forward_to_self_is_not_looped() {
  let proxy = local().start().await.unwrap();
  let mut stream = connect(&proxy).await;
  let request = format!(
    "GET http://127.0.0.1:{0}/loop HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\nConnection: close\r\n\r\n",
    proxy.local_port()
  );
  stream.write_all(request.as_bytes()).await.unwrap();
  let response = read_all(&mut stream).await;
  assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
  proxy.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remote_client_controls_instance() {
  let proxy = local().start().await.unwrap();
  let client = ProxyClient::new("127.0.0.1", proxy.local_port());

  let status = client.status().await.unwrap();
  assert_eq!(status.ports, vec![proxy.local_port()]);
  assert!(ProxyLifecycle::is_running(&client).await);
  ProxyLifecycle::start(&client).await.unwrap();

  client.reset().await.unwrap();
  assert!(proxy.log().is_empty());

  client.stop().await.unwrap();
  wait_until_stopped(&proxy).await;
  assert!(!client.is_running().await);
  // stopping an already stopped instance is a no-op on both handles
  client.stop().await.unwrap();
  proxy.stop().await.unwrap();
  // and it can come back
  proxy.start().await.unwrap();
  assert!(client.is_running().await);
  proxy.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_interception_shares_certificate() {
  let proxy = local().start().await.unwrap();
  let port = proxy.local_port();
  let connector = client_trusting(proxy.ca_cert_der());

  let tasks = (0..8).map(|_| {
    let connector = connector.clone();
    tokio::spawn(async move {
      let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
      stream
        .write_all(b"CONNECT shared.test:443 HTTP/1.1\r\nHost: shared.test:443\r\n\r\n")
        .await
        .unwrap();
      read_head(&mut stream).await;
      let tls = connector
        .connect(ServerName::try_from("shared.test").unwrap(), stream)
        .await
        .unwrap();
      tls.get_ref().1.peer_certificates().unwrap()[0].clone()
    })
  });
  let leaves = futures::future::join_all(tasks).await;
  let first = leaves[0].as_ref().unwrap().clone();
  for leaf in leaves {
    assert_eq!(leaf.unwrap(), first);
  }
  proxy.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_aborts_idle_connections_after_grace() {
  let proxy = local()
    .shutdown_grace(Duration::from_millis(100))
    .start()
    .await
    .unwrap();
  // sits in the sniffer until aborted
  let mut idle = connect(&proxy).await;
  tokio::time::sleep(Duration::from_millis(50)).await;
  tokio::time::timeout(Duration::from_secs(5), proxy.stop())
    .await
    .expect("stop must not wait beyond the grace period")
    .unwrap();
  assert!(read_all(&mut idle).await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_pooled_upstream_is_reopened() {
  // the upstream hangs up 50ms after each answer
  let (upstream_port, accepted) = keep_alive_upstream(Duration::from_millis(50), None).await;
  let proxy = local()
    .remote("127.0.0.1", upstream_port)
    .start()
    .await
    .unwrap();

  let mut stream = connect(&proxy).await;
  stream
    .write_all(b"GET /first HTTP/1.1\r\nHost: mock.local\r\n\r\n")
    .await
    .unwrap();
  assert!(read_ok(&mut stream).await.starts_with("HTTP/1.1 200 OK\r\n"));
  tokio::time::sleep(Duration::from_millis(300)).await;
  stream
    .write_all(b"GET /second HTTP/1.1\r\nHost: mock.local\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let response = read_all(&mut stream).await;
  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
  assert_eq!(accepted.load(Ordering::SeqCst), 2);
  proxy.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_intercepted_upstream_is_reused_within_tunnel() {
  let (upstream_port, accepted) =
    keep_alive_upstream(Duration::from_secs(5), Some(tls_acceptor())).await;
  let proxy = local().start().await.unwrap();

  let mut tls = intercepted_tunnel(&proxy, "localhost", upstream_port)
    .await
    .unwrap();
  tls
    .write_all(b"GET /one HTTP/1.1\r\nHost: localhost\r\n\r\n")
    .await
    .unwrap();
  read_ok(&mut tls).await;
  tls
    .write_all(b"GET /two HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let response = read_all(&mut tls).await;
  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");

  assert_eq!(accepted.load(Ordering::SeqCst), 1);
  let records = proxy.log().snapshot();
  assert_eq!(records.len(), 2);
  let upstream = format!("localhost:{}", upstream_port);
  assert!(records
    .iter()
    .all(|r| r.upstream.as_deref() == Some(upstream.as_str())));
  proxy.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_intercepted_upstream_down_is_bad_gateway() {
  let proxy = local().start().await.unwrap();
  let closed = free_port();

  let mut tls = intercepted_tunnel(&proxy, "localhost", closed).await.unwrap();
  tls
    .write_all(b"GET /down HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let response = read_all(&mut tls).await;
  assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{response}");

  let records = proxy.log().snapshot();
  assert_eq!(records.len(), 1);
  assert_eq!(records[0].response.status_code(), 502);
  proxy.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_certificate_failure_closes_tunnel_silently() {
  let provider = RefusingProvider(CertificateAuthority::ephemeral().unwrap());
  let proxy = local()
    .certificate_provider(Arc::new(provider))
    .start()
    .await
    .unwrap();

  let result = intercepted_tunnel(&proxy, "localhost", 443).await;
  assert!(result.is_err(), "handshake must fail without a certificate");
  assert!(proxy.log().is_empty());
  proxy.stop().await.unwrap();
}
