//! TLS configuration shared by the accepting and the upstream side
//!
use crate::errors::{Error, Result};
use std::io::{BufRead, Cursor};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::pki_types::{ServerName, UnixTime};
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, DigitallySignedStruct, Error as TLSError, RootCertStore,
  ServerConfig, SignatureScheme,
};
use tokio_rustls::{LazyConfigAcceptor, StartHandshake};

/// The crypto provider used for every TLS config built by this crate.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Server-side config presenting `cert_chain`, offering HTTP/1.1 only.
pub(crate) fn server_config(
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
  let mut config = ServerConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)?;
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  Ok(Arc::new(config))
}

/// Read the ClientHello and return the pending handshake plus the SNI
/// hostname, if the client sent one.
pub(crate) async fn read_client_hello<IO>(stream: IO) -> Result<(StartHandshake<IO>, Option<String>)>
where
  IO: AsyncRead + AsyncWrite + Unpin,
{
  let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
    .await
    .map_err(|e| Error::tls_error(format!("failed to read ClientHello: {}", e)))?;
  let sni = start
    .client_hello()
    .server_name()
    .map(|name| name.to_ascii_lowercase());
  Ok((start, sni))
}

/// Represents a server X509 certificate trusted for upstream connections.
#[derive(Clone, Debug)]
pub struct Certificate {
  der: Vec<Vec<u8>>,
}

impl Certificate {
  /// Create a `Certificate` from a binary DER encoded certificate
  pub fn from_der(der: &[u8]) -> Result<Certificate> {
    Ok(Certificate {
      der: vec![der.to_owned()],
    })
  }

  /// Create a `Certificate` from a PEM encoded certificate or bundle.
  /// Example byte sources may be `.crt`, `.cer` or `.pem` files.
  pub fn from_pem(pem: &[u8]) -> Result<Certificate> {
    let der = read_pem_certs(&mut Cursor::new(pem))?
      .into_iter()
      .map(|c| c.as_ref().to_vec())
      .collect::<Vec<_>>();
    if der.is_empty() {
      return Err(Error::config("no certificate found in PEM input"));
    }
    Ok(Certificate { der })
  }

  pub(crate) fn add_to_tls(&self, root_cert_store: &mut RootCertStore) -> Result<()> {
    for der in &self.der {
      root_cert_store
        .add(CertificateDer::from(der.clone()))
        .map_err(|e| Error::config(format!("invalid root certificate: {}", e)))?;
    }
    Ok(())
  }
}

pub(crate) fn read_pem_certs(reader: &mut impl BufRead) -> Result<Vec<CertificateDer<'static>>> {
  rustls_pemfile::certs(reader)
    .map(|result| result.map_err(|_| Error::certificate_error("invalid certificate encoding")))
    .collect()
}

/// Accepts any upstream certificate. Used unless upstream verification is
/// turned on.
#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}
