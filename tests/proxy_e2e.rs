//! End-to-end proxy behavior over live localhost sockets: plain forwarding,
//! web mode, plugin short-circuits, opaque tunnels and keepalive.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};

use janus_proxy::config::ProxyConfig;
use janus_proxy::error::ProxyError;
use janus_proxy::http;
use janus_proxy::net::{Connection, Listener};
use janus_proxy::plugin::{
    HttpProtocolHandlerPlugin, HttpProxyBasePlugin, PluginRegistry, RequestAction, Verdict,
};
use janus_proxy::server::{run_proxy_server, ProxyState};

const ORIGIN_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.hostname = "127.0.0.1".to_string();
    config.port = 0;
    config.timeouts.idle = 5.0;
    config.timeouts.upstream_connect = 5.0;
    config
}

async fn spawn_proxy(registry: PluginRegistry) -> SocketAddr {
    let state = ProxyState::new(test_config(), registry).unwrap();
    let listener = Listener::bind(&state.config).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_proxy_server(listener, state, Arc::new(Notify::new())));
    addr
}

/// Minimal HTTP origin: serves `ORIGIN_RESPONSE` per request head and
/// reports each head it saw. Connections stay open for keepalive.
async fn spawn_origin() -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    let mut head = Vec::new();
                    let mut byte = [0u8; 1];
                    loop {
                        match stream.read(&mut byte).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => head.push(byte[0]),
                        }
                        if head.ends_with(b"\r\n\r\n") {
                            break;
                        }
                    }
                    tx.send(String::from_utf8_lossy(&head).into_owned()).ok();
                    if stream.write_all(ORIGIN_RESPONSE).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    (addr, rx)
}

async fn read_until(stream: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert_ne!(n, 0, "peer closed before {:?} arrived", needle);
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(needle.len()).any(|w| w == needle) {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for response");
    buf
}

#[tokio::test]
async fn test_absolute_form_request_is_proxied() {
    let (origin, mut heads) = spawn_origin().await;
    let proxy = spawn_proxy(PluginRegistry::builder().build()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{}/a?k=v HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        origin.port(),
        origin.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let response = read_until(&mut client, b"hello").await;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));

    // The upstream saw an origin-form target with headers intact.
    let head = heads.recv().await.unwrap();
    assert!(head.starts_with("GET /a?k=v HTTP/1.1\r\n"), "got: {head}");
    assert!(head.contains(&format!("Host: 127.0.0.1:{}", origin.port())));
}

#[tokio::test]
async fn test_origin_form_request_gets_404() {
    let proxy = spawn_proxy(PluginRegistry::builder().build()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_until(&mut client, b"\r\n\r\n").await;
    assert!(response.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
}

#[tokio::test]
async fn test_malformed_request_gets_400() {
    let proxy = spawn_proxy(PluginRegistry::builder().build()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(b"NOTAMETHOD / HTTP/1.1\r\n\r\n").await.unwrap();
    let response = read_until(&mut client, b"\r\n\r\n").await;
    assert!(response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
}

struct CannedResponder;

impl HttpProtocolHandlerPlugin for CannedResponder {
    fn name(&self) -> &'static str {
        "canned-responder"
    }

    fn on_request_complete(
        &mut self,
        _client: &mut Connection,
        request: &mut janus_proxy::http::HttpParser,
    ) -> Result<RequestAction, ProxyError> {
        let claimed = request
            .url
            .as_ref()
            .and_then(|u| u.remainder.as_deref())
            .map(|r| r.starts_with(b"/canned"))
            .unwrap_or(false);
        if claimed {
            Ok(RequestAction::Respond(http::build_response(
                200,
                "OK",
                &[("Content-Type", "text/plain")],
                b"from plugin",
            )))
        } else {
            Ok(RequestAction::Continue)
        }
    }
}

#[tokio::test]
async fn test_plugin_claims_web_request() {
    let registry = PluginRegistry::builder()
        .enable_protocol(Arc::new(|| Box::new(CannedResponder)))
        .build();
    let proxy = spawn_proxy(registry).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET /canned HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_until(&mut client, b"from plugin").await;
    assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
}

struct Suppressor {
    queue_response: bool,
}

impl HttpProxyBasePlugin for Suppressor {
    fn name(&self) -> &'static str {
        "suppressor"
    }

    fn handle_client_request(
        &mut self,
        _request: &mut janus_proxy::http::HttpParser,
        client: &mut Connection,
    ) -> Result<Verdict, ProxyError> {
        if self.queue_response {
            client.queue(http::build_response(403, "Forbidden", &[], b"blocked"));
        }
        Ok(Verdict::Suppress)
    }
}

#[tokio::test]
async fn test_suppressed_upstream_yields_502() {
    let (origin, mut heads) = spawn_origin().await;
    let registry = PluginRegistry::builder()
        .enable_proxy(Arc::new(|| {
            Box::new(Suppressor {
                queue_response: false,
            })
        }))
        .build();
    let proxy = spawn_proxy(registry).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: x\r\n\r\n",
        origin.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let response = read_until(&mut client, b"\r\n\r\n").await;
    assert!(response.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));
    assert!(heads.try_recv().is_err(), "upstream dispatch was suppressed");
}

#[tokio::test]
async fn test_suppressed_upstream_with_plugin_queued_response() {
    let (origin, _heads) = spawn_origin().await;
    let registry = PluginRegistry::builder()
        .enable_proxy(Arc::new(|| {
            Box::new(Suppressor {
                queue_response: true,
            })
        }))
        .build();
    let proxy = spawn_proxy(registry).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: x\r\n\r\n",
        origin.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let response = read_until(&mut client, b"blocked").await;
    assert!(response.starts_with(b"HTTP/1.1 403 Forbidden\r\n"));
}

struct DnsOverride {
    port: u16,
}

impl HttpProxyBasePlugin for DnsOverride {
    fn name(&self) -> &'static str {
        "dns-override"
    }

    fn resolve_dns(
        &mut self,
        _host: &str,
        _port: u16,
    ) -> Result<Option<(String, u16)>, ProxyError> {
        Ok(Some(("127.0.0.1".to_string(), self.port)))
    }
}

#[tokio::test]
async fn test_resolve_dns_override_redirects_upstream() {
    let (origin, mut heads) = spawn_origin().await;
    let origin_port = origin.port();
    let registry = PluginRegistry::builder()
        .enable_proxy(Arc::new(move || Box::new(DnsOverride { port: origin_port })))
        .build();
    let proxy = spawn_proxy(registry).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET http://name.invalid/x HTTP/1.1\r\nHost: name.invalid\r\n\r\n")
        .await
        .unwrap();
    let response = read_until(&mut client, b"hello").await;
    assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
    let head = heads.recv().await.unwrap();
    assert!(head.starts_with("GET /x HTTP/1.1\r\n"));
}

#[tokio::test]
async fn test_connect_without_interception_tunnels_opaquely() {
    // Echo origin: whatever arrives goes straight back.
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = echo.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    let proxy = spawn_proxy(PluginRegistry::builder().build()).await;
    let mut client = TcpStream::connect(proxy).await.unwrap();
    let connect = format!(
        "CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        echo_addr.port(),
        echo_addr.port()
    );
    client.write_all(connect.as_bytes()).await.unwrap();

    let established = read_until(&mut client, b"\r\n\r\n").await;
    assert_eq!(
        established,
        b"HTTP/1.1 200 Connection Established\r\n\r\n".to_vec()
    );

    // Arbitrary bytes flow both ways with no parser involvement.
    client.write_all(b"not http at all \x00\x01\x02").await.unwrap();
    let echoed = read_until(&mut client, b"\x00\x01\x02").await;
    assert_eq!(echoed, b"not http at all \x00\x01\x02".to_vec());
}

#[tokio::test]
async fn test_keepalive_reuses_client_and_upstream_connections() {
    let (origin, mut heads) = spawn_origin().await;
    let proxy = spawn_proxy(PluginRegistry::builder().build()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    for path in ["/first", "/second"] {
        let request = format!(
            "GET http://127.0.0.1:{}{} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
            origin.port(),
            path,
            origin.port()
        );
        client.write_all(request.as_bytes()).await.unwrap();
        let response = read_until(&mut client, b"hello").await;
        assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
    }

    let first = heads.recv().await.unwrap();
    let second = heads.recv().await.unwrap();
    assert!(first.starts_with("GET /first "));
    assert!(second.starts_with("GET /second "));
}

struct ChunkTagger;

impl HttpProxyBasePlugin for ChunkTagger {
    fn name(&self) -> &'static str {
        "chunk-tagger"
    }

    fn handle_upstream_chunk(&mut self, chunk: Bytes) -> Result<Bytes, ProxyError> {
        // Rewrite the canned body on its way through.
        let rewritten = chunk.as_ref().to_vec();
        let rewritten = String::from_utf8_lossy(&rewritten).replace("hello", "HELLO");
        Ok(Bytes::from(rewritten.into_bytes()))
    }
}

#[tokio::test]
async fn test_upstream_chunks_flow_through_rewrite_hooks() {
    let (origin, _heads) = spawn_origin().await;
    let registry = PluginRegistry::builder()
        .enable_proxy(Arc::new(|| Box::new(ChunkTagger)))
        .build();
    let proxy = spawn_proxy(registry).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: x\r\n\r\n",
        origin.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let response = read_until(&mut client, b"HELLO").await;
    assert!(String::from_utf8_lossy(&response).contains("HELLO"));
}

#[tokio::test]
async fn test_unreachable_upstream_yields_502() {
    let proxy = spawn_proxy(PluginRegistry::builder().build()).await;

    // A port nothing listens on.
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = unused.local_addr().unwrap();
    drop(unused);

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: x\r\n\r\n",
        dead.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let response = read_until(&mut client, b"\r\n\r\n").await;
    assert!(response.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));
}
