pub mod certs;

pub use certs::CertificateAuthority;

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::ProxyConfig;
use crate::error::ProxyError;

/// Orchestrates the certificate side of a TLS man-in-the-middle: per-host
/// leaf minting via the loaded [`CertificateAuthority`] and the rustls
/// server configuration presented to intercepted clients.
pub struct TlsInterceptor {
    authority: CertificateAuthority,
}

impl TlsInterceptor {
    pub fn new(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let (ca_cert_file, ca_key_file, ca_signing_key_file, ca_cert_dir) = match (
            &config.ca_cert_file,
            &config.ca_key_file,
            &config.ca_signing_key_file,
            &config.ca_cert_dir,
        ) {
            (Some(cert), Some(key), Some(signing), Some(dir)) => (cert, key, signing, dir),
            _ => {
                return Err(ProxyError::Config(
                    "TLS interception requires CA cert, CA key, signing key and cache dir"
                        .to_string(),
                ));
            }
        };
        let authority =
            CertificateAuthority::load(ca_cert_file, ca_key_file, ca_signing_key_file, ca_cert_dir)?;
        Ok(Self { authority })
    }

    /// Build the client-facing TLS acceptor for `host`: the cached-or-minted
    /// leaf chain plus the shared signing key.
    pub async fn acceptor_for(&self, host: &str) -> Result<TlsAcceptor, ProxyError> {
        let chain = self.authority.leaf_for(host).await?;
        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, self.authority.signing_key())
            .map_err(|e| ProxyError::TlsIntercept(format!("server config: {}", e)))?;
        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }

    pub fn cert_file_path(&self, host: &str) -> std::path::PathBuf {
        self.authority.cert_file_path(host)
    }
}

/// Upstream TLS client configuration: the configured trust-anchor bundle,
/// or the bundled webpki roots when none is set.
pub fn upstream_connector(ca_file: Option<&Path>) -> Result<TlsConnector, ProxyError> {
    let mut roots = RootCertStore::empty();
    match ca_file {
        Some(path) => {
            let pem = std::fs::read(path).map_err(|e| {
                ProxyError::Config(format!("cannot read ca_file {}: {}", path.display(), e))
            })?;
            let mut added = 0;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                let cert = cert.map_err(|e| {
                    ProxyError::Config(format!("bad cert in {}: {}", path.display(), e))
                })?;
                roots.add(cert).map_err(|e| {
                    ProxyError::Config(format!("bad cert in {}: {}", path.display(), e))
                })?;
                added += 1;
            }
            if added == 0 {
                return Err(ProxyError::Config(format!(
                    "no certificates in ca_file {}",
                    path.display()
                )));
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// SNI/verification name for an upstream handshake.
pub fn server_name(host: &str) -> Result<ServerName<'static>, ProxyError> {
    ServerName::try_from(host.to_string())
        .map_err(|e| ProxyError::UpstreamConnect(format!("invalid server name {}: {}", host, e)))
}
