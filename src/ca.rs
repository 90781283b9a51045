//! Certificate authority used to intercept TLS
//!
//! Leaf certificates are issued on demand for every hostname a client asks
//! for (CONNECT target or SNI) and cached for the lifetime of the proxy.
//! Nothing is written to disk: the root is either generated per instance or
//! loaded from a user supplied PEM pair.

use crate::errors::{Error, Result};
use crate::tls;
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::io::Cursor;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Leaf certificate validity (1 year)
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Backdate `not_before` to tolerate clock skew between client and proxy
const NOT_BEFORE_OFFSET: i64 = 60;

/// Issues server certificates for intercepted hostnames.
pub trait CertificateProvider: Send + Sync {
  /// Certificate chain (leaf first) and private key for `hostname`.
  fn issue(&self, hostname: &str) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>;

  /// Root certificate clients must trust, DER encoded.
  fn ca_cert_der(&self) -> CertificateDer<'static>;

  /// Root certificate clients must trust, PEM encoded.
  fn ca_cert_pem(&self) -> String;
}

/// Root CA signing leaf certificates with `rcgen`.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateAuthority").finish_non_exhaustive()
  }
}

impl CertificateAuthority {
  /// Generate a throwaway root valid for ten years.
  pub fn ephemeral() -> Result<Self> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "proxymock CA");
    dn.push(DnType::OrganizationName, "proxymock");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to generate CA: {}", e)))?;
    let ca_cert_der = cert.der().clone();
    let ca_cert_pem = cert.pem();
    tracing::info!("[CA] generated ephemeral root certificate");
    Ok(Self {
      issuer: Issuer::new(params, key_pair),
      ca_cert_der,
      ca_cert_pem,
    })
  }

  /// Load a root from PEM encoded certificate and private key.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::certificate_error(format!("Failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair).map_err(|e| {
      Error::certificate_error(format!("Failed to create issuer from CA cert: {}", e))
    })?;
    let ca_cert_der = tls::read_pem_certs(&mut Cursor::new(cert_pem.as_bytes()))?
      .into_iter()
      .next()
      .ok_or_else(|| Error::certificate_error("No certificate found in PEM"))?;
    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem.to_string(),
    })
  }

  /// Load a root from PEM files on disk.
  pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
    let (cert_path, key_path) = (cert_path.as_ref(), key_path.as_ref());
    let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| {
      Error::config(format!("Failed to read CA cert {}: {}", cert_path.display(), e))
    })?;
    let key_pem = std::fs::read_to_string(key_path).map_err(|e| {
      Error::config(format!("Failed to read CA key {}: {}", key_path.display(), e))
    })?;
    let ca = Self::from_pem(&cert_pem, &key_pem)?;
    tracing::info!("[CA] loaded root certificate from {}", cert_path.display());
    Ok(ca)
  }
}

impl CertificateProvider for CertificateAuthority {
  fn issue(&self, hostname: &str) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    // IP targets get an iPAddress SAN, names a dNSName SAN
    params.subject_alt_names = if let Ok(ip) = hostname.parse::<IpAddr>() {
      vec![SanType::IpAddress(ip)]
    } else {
      vec![SanType::DnsName(hostname.try_into().map_err(|_| {
        Error::certificate_error(format!("Invalid domain name: {}", hostname))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("Failed to sign server cert: {}", e)))?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((vec![cert.der().clone(), self.ca_cert_der.clone()], key))
  }

  fn ca_cert_der(&self) -> CertificateDer<'static> {
    self.ca_cert_der.clone()
  }

  fn ca_cert_pem(&self) -> String {
    self.ca_cert_pem.clone()
  }
}

/// A leaf certificate issued for one hostname, with its ready-to-use TLS
/// server config.
pub struct CertificateBinding {
  hostname: String,
  cert_chain: Vec<CertificateDer<'static>>,
  server_config: Arc<ServerConfig>,
}

impl std::fmt::Debug for CertificateBinding {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateBinding")
      .field("hostname", &self.hostname)
      .finish_non_exhaustive()
  }
}

impl CertificateBinding {
  /// Hostname the certificate was issued for
  pub fn hostname(&self) -> &str {
    &self.hostname
  }
  /// Leaf certificate
  pub fn leaf(&self) -> &CertificateDer<'static> {
    &self.cert_chain[0]
  }
  /// Full chain, leaf first
  pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
    &self.cert_chain
  }
  /// Server config presenting this certificate
  pub fn server_config(&self) -> Arc<ServerConfig> {
    self.server_config.clone()
  }
}

/// Caches one [`CertificateBinding`] per hostname.
///
/// Concurrent first requests for the same hostname share a single issuance,
/// so a hostname resolves to the same certificate for the whole lifetime of
/// the manager.
pub struct CertificateManager {
  provider: Arc<dyn CertificateProvider>,
  cert_cache: Cache<String, Arc<CertificateBinding>>,
}

impl CertificateManager {
  /// Manager issuing through `provider`
  pub fn new(provider: Arc<dyn CertificateProvider>) -> Self {
    Self {
      provider,
      cert_cache: Cache::builder().build(),
    }
  }

  /// Get or issue the binding for `hostname`.
  pub async fn binding(&self, hostname: &str) -> Result<Arc<CertificateBinding>> {
    let hostname = normalize_hostname(hostname);
    if hostname.is_empty() {
      return Err(Error::certificate_error("empty hostname"));
    }
    let provider = self.provider.clone();
    self
      .cert_cache
      .try_get_with(hostname.clone(), async move {
        tracing::debug!("[CA] issuing certificate for {}", hostname);
        let (cert_chain, key) = provider.issue(&hostname)?;
        if cert_chain.is_empty() {
          return Err(Error::certificate_error(format!(
            "provider returned an empty chain for {}",
            hostname
          )));
        }
        let server_config = tls::server_config(cert_chain.clone(), key)?;
        Ok(Arc::new(CertificateBinding {
          hostname,
          cert_chain,
          server_config,
        }))
      })
      .await
      .map_err(|e: Arc<Error>| Error::Certificate(e.to_string()))
  }

  /// Root certificate, DER encoded
  pub fn ca_cert_der(&self) -> CertificateDer<'static> {
    self.provider.ca_cert_der()
  }

  /// Root certificate, PEM encoded
  pub fn ca_cert_pem(&self) -> String {
    self.provider.ca_cert_pem()
  }
}

fn normalize_hostname(hostname: &str) -> String {
  let hostname = hostname.trim().trim_end_matches('.');
  hostname
    .strip_prefix('[')
    .and_then(|h| h.strip_suffix(']'))
    .unwrap_or(hostname)
    .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn manager() -> CertificateManager {
    CertificateManager::new(Arc::new(CertificateAuthority::ephemeral().unwrap()))
  }

  #[tokio::test]
  async fn same_hostname_same_certificate() {
    let manager = manager();
    let a = manager.binding("example.com").await.unwrap();
    let b = manager.binding("EXAMPLE.com.").await.unwrap();
    assert_eq!(a.leaf(), b.leaf());
    let other = manager.binding("other.example").await.unwrap();
    assert_ne!(a.leaf(), other.leaf());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_first_use_issues_once() {
    let manager = Arc::new(manager());
    let tasks = (0..16).map(|_| {
      let manager = manager.clone();
      tokio::spawn(async move { manager.binding("race.test").await.unwrap() })
    });
    let bindings = futures::future::join_all(tasks).await;
    let first = bindings[0].as_ref().unwrap().leaf().clone();
    for binding in bindings {
      assert_eq!(binding.unwrap().leaf(), &first);
    }
  }

  #[tokio::test]
  async fn ip_hosts_are_supported() {
    let binding = manager().binding("127.0.0.1").await.unwrap();
    assert_eq!(binding.cert_chain().len(), 2);
    assert_eq!(binding.hostname(), "127.0.0.1");
  }

  #[test]
  fn pem_round_trip() {
    let cert = rcgen::generate_simple_self_signed(vec!["unused".to_string()]).unwrap();
    // a self-signed leaf is not a CA, but the issuer only needs its name and key
    let ca = CertificateAuthority::from_pem(&cert.cert.pem(), &cert.signing_key.serialize_pem()).unwrap();
    assert_eq!(ca.ca_cert_der(), cert.cert.der().clone());
    let (chain, _) = ca.issue("loaded.test").unwrap();
    assert_eq!(chain.len(), 2);
  }

  #[test]
  fn invalid_names_fail_to_issue() {
    let ca = CertificateAuthority::ephemeral().unwrap();
    assert!(ca.issue("exämple.com").is_err());
  }
}
