//! Full CONNECT interception against a local TLS origin: the client receives
//! `200 Connection Established`, handshakes against a CA-signed leaf for the
//! CONNECT host, and the decrypted exchange is proxied to the TLS upstream.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName};
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use janus_proxy::config::ProxyConfig;
use janus_proxy::error::ProxyError;
use janus_proxy::net::{Connection, Listener};
use janus_proxy::plugin::{HttpProtocolHandlerPlugin, PluginRegistry, RequestAction};
use janus_proxy::server::{run_proxy_server, ProxyState};

const ORIGIN_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nsecret data";

struct TestCa {
    cert: rcgen::Certificate,
    key: KeyPair,
    ca_cert_file: PathBuf,
    ca_key_file: PathBuf,
    signing_key_file: PathBuf,
}

fn write_test_ca(dir: &Path) -> TestCa {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "interception test CA");
    params.distinguished_name = dn;
    let cert = params.self_signed(&key).unwrap();
    let signing_key = KeyPair::generate().unwrap();

    let ca_cert_file = dir.join("ca.pem");
    let ca_key_file = dir.join("ca-key.pem");
    let signing_key_file = dir.join("signing-key.pem");
    std::fs::write(&ca_cert_file, cert.pem()).unwrap();
    std::fs::write(&ca_key_file, key.serialize_pem()).unwrap();
    std::fs::write(&signing_key_file, signing_key.serialize_pem()).unwrap();
    TestCa {
        cert,
        key,
        ca_cert_file,
        ca_key_file,
        signing_key_file,
    }
}

/// TLS origin for `localhost` with a leaf signed by the test CA. Serves
/// `ORIGIN_RESPONSE` per request head, keepalive style.
async fn spawn_tls_origin(ca: &TestCa) -> SocketAddr {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    params.distinguished_name.push(DnType::CommonName, "localhost");
    let cert = params.signed_by(&key, &ca.cert, &ca.key).unwrap();

    let chain: Vec<CertificateDer<'static>> = vec![cert.der().clone()];
    let key_der = PrivatePkcs8KeyDer::from(key.serialize_der()).into();
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key_der)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                loop {
                    if read_head(&mut tls).await.is_none() {
                        return;
                    }
                    if tls.write_all(ORIGIN_RESPONSE).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Option<Vec<u8>> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => head.push(byte[0]),
        }
        if head.ends_with(b"\r\n\r\n") {
            return Some(head);
        }
    }
}

/// Records every completed request target the handler parses — inside an
/// intercepted tunnel that means the decrypted traffic.
struct TargetRecorder {
    tx: mpsc::UnboundedSender<String>,
}

impl HttpProtocolHandlerPlugin for TargetRecorder {
    fn name(&self) -> &'static str {
        "target-recorder"
    }

    fn on_request_complete(
        &mut self,
        _client: &mut Connection,
        request: &mut janus_proxy::http::HttpParser,
    ) -> Result<RequestAction, ProxyError> {
        let method = request
            .method
            .as_deref()
            .map(|m| String::from_utf8_lossy(m).into_owned())
            .unwrap_or_default();
        let target = request
            .url
            .as_ref()
            .map(|u| u.to_string())
            .unwrap_or_default();
        self.tx.send(format!("{} {}", method, target)).ok();
        Ok(RequestAction::Continue)
    }
}

struct Intercepted {
    proxy: SocketAddr,
    origin: SocketAddr,
    cache_dir: PathBuf,
    ca_der: CertificateDer<'static>,
    seen: mpsc::UnboundedReceiver<String>,
}

async fn setup(dir: &Path) -> Intercepted {
    let ca = write_test_ca(dir);
    let origin = spawn_tls_origin(&ca).await;

    let mut config = ProxyConfig::default();
    config.hostname = "127.0.0.1".to_string();
    config.port = 0;
    config.timeouts.idle = 5.0;
    config.timeouts.upstream_connect = 5.0;
    config.ca_cert_file = Some(ca.ca_cert_file.clone());
    config.ca_key_file = Some(ca.ca_key_file.clone());
    config.ca_signing_key_file = Some(ca.signing_key_file.clone());
    config.ca_cert_dir = Some(dir.join("certs"));
    // The origin's leaf chains to the same throwaway CA.
    config.ca_file = Some(ca.ca_cert_file.clone());
    config.validate().unwrap();

    let (tx, seen) = mpsc::unbounded_channel();
    let registry = PluginRegistry::builder()
        .enable_protocol(Arc::new(move || {
            Box::new(TargetRecorder { tx: tx.clone() })
        }))
        .build();

    let state = ProxyState::new(config, registry).unwrap();
    let listener = Listener::bind(&state.config).await.unwrap();
    let proxy = listener.local_addr().unwrap();
    tokio::spawn(run_proxy_server(listener, state, Arc::new(Notify::new())));

    Intercepted {
        proxy,
        origin,
        cache_dir: dir.join("certs"),
        ca_der: ca.cert.der().clone(),
        seen,
    }
}

/// CONNECT through the proxy, then TLS-handshake against the minted leaf.
/// The handshake only succeeds if the leaf is valid for `localhost` and
/// chains to the test CA — that is the interception contract.
async fn open_intercepted_tunnel(
    setup: &Intercepted,
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let mut tcp = TcpStream::connect(setup.proxy).await.unwrap();
    let connect = format!(
        "CONNECT localhost:{} HTTP/1.1\r\nHost: localhost:{}\r\n\r\n",
        setup.origin.port(),
        setup.origin.port()
    );
    tcp.write_all(connect.as_bytes()).await.unwrap();

    let established = tokio::time::timeout(Duration::from_secs(10), read_head(&mut tcp))
        .await
        .expect("timed out waiting for CONNECT reply")
        .expect("proxy closed during CONNECT");
    assert_eq!(
        established,
        b"HTTP/1.1 200 Connection Established\r\n\r\n".to_vec()
    );

    let mut roots = RootCertStore::empty();
    roots.add(setup.ca_der.clone()).unwrap();
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));
    connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .expect("client handshake against the minted leaf")
}

async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(tls: &mut S, path: &str) -> String {
    let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
    tls.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let mut chunk = [0u8; 4096];
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let n = tls.read(&mut chunk).await.unwrap();
            assert_ne!(n, 0, "tunnel closed before response");
            response.extend_from_slice(&chunk[..n]);
            if response.ends_with(b"secret data") {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for intercepted response");
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn test_connect_interception_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let mut setup = setup(dir.path()).await;

    let mut tls = open_intercepted_tunnel(&setup).await;
    let response = exchange(&mut tls, "/secret").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

    // One leaf artifact for the CONNECT host.
    let leaf = setup.cache_dir.join("localhost.pem");
    assert!(leaf.exists());

    // The handler re-parsed the decrypted request.
    let first = setup.seen.recv().await.unwrap();
    assert!(first.starts_with("CONNECT "), "got: {first}");
    let second = setup.seen.recv().await.unwrap();
    assert_eq!(second, "GET /secret");
}

#[tokio::test]
async fn test_keepalive_inside_intercepted_tunnel() {
    let dir = tempfile::tempdir().unwrap();
    let mut setup = setup(dir.path()).await;

    let mut tls = open_intercepted_tunnel(&setup).await;
    for path in ["/one", "/two"] {
        let response = exchange(&mut tls, path).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    }

    let targets: Vec<String> = [
        setup.seen.recv().await.unwrap(),
        setup.seen.recv().await.unwrap(),
        setup.seen.recv().await.unwrap(),
    ]
    .into();
    assert!(targets[0].starts_with("CONNECT "));
    assert_eq!(targets[1], "GET /one");
    assert_eq!(targets[2], "GET /two");
}

#[tokio::test]
async fn test_second_tunnel_reuses_cached_leaf() {
    let dir = tempfile::tempdir().unwrap();
    let setup = setup(dir.path()).await;

    let mut first = open_intercepted_tunnel(&setup).await;
    exchange(&mut first, "/a").await;
    let leaf = setup.cache_dir.join("localhost.pem");
    let minted = std::fs::read(&leaf).unwrap();

    let mut second = open_intercepted_tunnel(&setup).await;
    exchange(&mut second, "/b").await;
    assert_eq!(
        std::fs::read(&leaf).unwrap(),
        minted,
        "cached artifact is stable across tunnels"
    );

    let pems: Vec<_> = std::fs::read_dir(&setup.cache_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|x| x == "pem").unwrap_or(false))
        .collect();
    assert_eq!(pems.len(), 1);
}
