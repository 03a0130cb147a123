use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::ProxyError;

/// CA material plus the on-disk leaf-certificate cache.
///
/// Every minted leaf shares one keypair (`ca_signing_key_file`) and is
/// signed by the configured CA, so the client-facing TLS server always
/// presents `(signing key, <host> leaf)`. Leaves live at
/// `<cache_dir>/<host>.pem`; the cache has no expiry — an operator may
/// delete entries to force a re-mint on next use.
pub struct CertificateAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    signing_key: KeyPair,
    signing_key_der: PrivateKeyDer<'static>,
    cache_dir: PathBuf,
    /// Per-host mint locks so concurrent works converge on one artifact.
    minting: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cache_dir", &self.cache_dir)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    pub fn load(
        ca_cert_file: &Path,
        ca_key_file: &Path,
        ca_signing_key_file: &Path,
        cache_dir: &Path,
    ) -> Result<Self, ProxyError> {
        let ca_pem = read_pem(ca_cert_file)?;
        let ca_key_pem = read_pem(ca_key_file)?;
        let signing_pem = read_pem(ca_signing_key_file)?;

        let ca_key = KeyPair::from_pem(&ca_key_pem)
            .map_err(|e| ProxyError::TlsIntercept(format!("bad CA key: {}", e)))?;
        let ca_cert = CertificateParams::from_ca_cert_pem(&ca_pem)
            .map_err(|e| ProxyError::TlsIntercept(format!("bad CA cert: {}", e)))?
            .self_signed(&ca_key)
            .map_err(|e| ProxyError::TlsIntercept(format!("bad CA cert: {}", e)))?;
        let signing_key = KeyPair::from_pem(&signing_pem)
            .map_err(|e| ProxyError::TlsIntercept(format!("bad signing key: {}", e)))?;

        let signing_key_der =
            rustls_pemfile::private_key(&mut signing_pem.as_bytes())
                .map_err(|e| ProxyError::TlsIntercept(format!("bad signing key: {}", e)))?
                .ok_or_else(|| {
                    ProxyError::TlsIntercept(format!(
                        "no private key in {}",
                        ca_signing_key_file.display()
                    ))
                })?;

        std::fs::create_dir_all(cache_dir).map_err(|e| {
            ProxyError::TlsIntercept(format!("cannot create {}: {}", cache_dir.display(), e))
        })?;

        info!(
            "tls: certificate authority loaded, cache_dir={}",
            cache_dir.display()
        );
        Ok(Self {
            ca_cert,
            ca_key,
            signing_key,
            signing_key_der,
            cache_dir: cache_dir.to_path_buf(),
            minting: DashMap::new(),
        })
    }

    /// The private key matching every minted leaf.
    pub fn signing_key(&self) -> PrivateKeyDer<'static> {
        self.signing_key_der.clone_key()
    }

    /// Leaf certificate chain for `host`, minting and caching on first use.
    /// At most one mint runs per hostname at a time; the on-disk artifact is
    /// written via a temp file and atomic rename so concurrent workers never
    /// observe a torn cert.
    pub async fn leaf_for(&self, host: &str) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
        let lock = self.minting.entry(host.to_string()).or_default().clone();
        let _minting = lock.lock().await;

        let path = self.cert_file_path(host);
        if path.exists() {
            if let Ok(chain) = load_cert_chain(&path) {
                if !chain.is_empty() {
                    debug!("tls: leaf cache hit, host={}", host);
                    return Ok(chain);
                }
            }
            // Unreadable cache entry; fall through and re-mint.
        }

        let pem = self.mint(host)?;
        write_atomic(&path, pem.as_bytes())
            .map_err(|e| ProxyError::TlsIntercept(format!("cannot cache leaf: {}", e)))?;
        info!("tls: leaf minted, host={}, path={}", host, path.display());
        load_cert_chain(&path)
    }

    pub fn cert_file_path(&self, host: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.pem", sanitize_hostname(host)))
    }

    fn mint(&self, host: &str) -> Result<String, ProxyError> {
        let mut params = match host.parse::<IpAddr>() {
            Ok(ip) => {
                let mut params = CertificateParams::new(Vec::new())
                    .map_err(|e| ProxyError::TlsIntercept(format!("cert params: {}", e)))?;
                params.subject_alt_names.push(SanType::IpAddress(ip));
                params
            }
            Err(_) => CertificateParams::new(vec![host.to_string()])
                .map_err(|e| ProxyError::TlsIntercept(format!("cert params: {}", e)))?,
        };
        params.distinguished_name.push(DnType::CommonName, host);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        let leaf = params
            .signed_by(&self.signing_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| ProxyError::TlsIntercept(format!("signing failed: {}", e)))?;
        Ok(leaf.pem())
    }
}

fn read_pem(path: &Path) -> Result<String, ProxyError> {
    std::fs::read_to_string(path)
        .map_err(|e| ProxyError::TlsIntercept(format!("cannot read {}: {}", path.display(), e)))
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let pem = std::fs::read(path)
        .map_err(|e| ProxyError::TlsIntercept(format!("cannot read {}: {}", path.display(), e)))?;
    let chain: Result<Vec<_>, _> = rustls_pemfile::certs(&mut pem.as_slice()).collect();
    chain.map_err(|e| ProxyError::TlsIntercept(format!("bad cert in {}: {}", path.display(), e)))
}

/// Restrict cache filenames to DNS-safe characters; IP literals pass
/// through, anything else is replaced.
fn sanitize_hostname(host: &str) -> String {
    host.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Write to a temp file in the same directory, then rename into place.
/// Rename is atomic within a filesystem, so a concurrent reader sees
/// either no file or a whole one.
fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent dir"))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));

    let mut file = std::fs::File::create(&tmp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    match std::fs::rename(&tmp_path, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}

#[cfg(test)]
pub(crate) fn write_test_ca(dir: &Path) -> (PathBuf, PathBuf, PathBuf) {
    use rcgen::{BasicConstraints, DistinguishedName, IsCa};

    let ca_key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "janus test CA");
    params.distinguished_name = dn;
    let ca_cert = params.self_signed(&ca_key).unwrap();
    let signing_key = KeyPair::generate().unwrap();

    let ca_cert_file = dir.join("ca.pem");
    let ca_key_file = dir.join("ca-key.pem");
    let signing_key_file = dir.join("signing-key.pem");
    std::fs::write(&ca_cert_file, ca_cert.pem()).unwrap();
    std::fs::write(&ca_key_file, ca_key.serialize_pem()).unwrap();
    std::fs::write(&signing_key_file, signing_key.serialize_pem()).unwrap();
    (ca_cert_file, ca_key_file, signing_key_file)
}
