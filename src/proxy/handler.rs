use std::io;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::http::{self, HttpParser};
use crate::net::{Connection, PlainStream};
use crate::plugin::{
    self, HttpProtocolHandlerPlugin, HttpProxyBasePlugin, RequestAction, Verdict,
};
use crate::server::ProxyState;
use crate::tls;

/// Work lifecycle position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkPhase {
    Initialized,
    ParsingRequest,
    ServingWeb,
    ProxyingPlain,
    TunnelEstablished,
    Intercepting,
    Closed,
}

/// The per-connection protocol handler: one work, one task.
///
/// Drives a request-at-a-time loop over the client connection: feed bytes to
/// the request parser, invoke plugin hooks on completion, then route — serve
/// as a web server (origin-form), forward upstream (absolute-form), tunnel
/// opaquely or intercept TLS (`CONNECT`). Suspension happens only at I/O
/// awaits; everything between them runs in arrival order.
pub struct HttpProtocolHandler {
    state: ProxyState,
    client: Connection,
    upstream: Option<Connection>,
    upstream_addr: Option<(String, u16)>,
    request: HttpParser,
    phase: WorkPhase,
    protocol_plugins: Vec<Box<dyn HttpProtocolHandlerPlugin>>,
    proxy_plugins: Vec<Box<dyn HttpProxyBasePlugin>>,
    /// Bytes read from the client but not yet consumed by the parser
    /// (fragmented heads, pipelined requests).
    client_buf: BytesMut,
    peer: String,
    /// CONNECT authority while intercepting; inner requests are proxied
    /// here.
    connect_target: Option<(String, u16)>,
    /// Response bytes already reached the client; error replies are no
    /// longer possible.
    response_started: bool,
    /// `200 Connection Established` was sent; the wire now belongs to the
    /// tunnel.
    tunnel_established: bool,
    close_after_exchange: bool,
}

impl HttpProtocolHandler {
    pub fn new(state: ProxyState, stream: PlainStream, peer: String) -> Self {
        let request = new_request_parser(&state.config);
        let protocol_plugins = state.plugins.instantiate_protocol();
        let proxy_plugins = state.plugins.instantiate_proxy();
        Self {
            state,
            client: Connection::from_plain(stream, "client"),
            upstream: None,
            upstream_addr: None,
            request,
            phase: WorkPhase::Initialized,
            protocol_plugins,
            proxy_plugins,
            client_buf: BytesMut::new(),
            peer,
            connect_target: None,
            response_started: false,
            tunnel_established: false,
            close_after_exchange: false,
        }
    }

    /// Run the work to completion. Errors are recovered here — a failing
    /// work never takes the worker down.
    pub async fn run(mut self) {
        match self.serve().await {
            Ok(()) => debug!("work: finished, client={}", self.peer),
            Err(e) => self.fail(&e).await,
        }
        self.teardown().await;
    }

    async fn serve(&mut self) -> Result<(), ProxyError> {
        loop {
            let started = Instant::now();
            if self.phase != WorkPhase::Intercepting {
                self.phase = WorkPhase::ParsingRequest;
            }
            if !self.read_request().await? {
                return Ok(());
            }

            match plugin::chain_request_complete(
                &mut self.protocol_plugins,
                &mut self.client,
                &mut self.request,
            ) {
                RequestAction::Drop => return Ok(()),
                RequestAction::Respond(raw) => {
                    self.client.queue(raw);
                    self.client.flush().await?;
                    // A plugin-authored response has unknown framing; close
                    // rather than guess at reusability.
                    self.close_after_exchange = true;
                    self.log_access(0, started);
                }
                RequestAction::Continue => {
                    if self.request.is_connect() && self.phase != WorkPhase::Intercepting {
                        self.handle_connect().await?;
                        if self.phase != WorkPhase::Intercepting {
                            // Opaque tunnel ran to completion.
                            return Ok(());
                        }
                        self.reset_exchange();
                        continue;
                    } else if self.request.is_connect() {
                        // CONNECT nested inside an intercepted tunnel.
                        self.client
                            .queue(http::error_response(405, "Method Not Allowed"));
                        self.client.flush().await?;
                        self.close_after_exchange = true;
                        self.log_access(405, started);
                    } else if self.phase == WorkPhase::Intercepting || self.is_absolute_request() {
                        let status = self.serve_proxy().await?;
                        self.log_access(status, started);
                    } else {
                        let status = self.serve_web().await?;
                        self.log_access(status, started);
                    }
                }
            }

            if self.close_after_exchange
                || !self.request.is_reusable()
                || self.client.is_closed()
            {
                return Ok(());
            }
            self.reset_exchange();
        }
    }

    fn is_absolute_request(&self) -> bool {
        self.request
            .url
            .as_ref()
            .map(|u| u.scheme.is_some())
            .unwrap_or(false)
    }

    /// Read until the request parser reports COMPLETE. Returns false on a
    /// clean close before any request bytes.
    async fn read_request(&mut self) -> Result<bool, ProxyError> {
        let idle = Duration::from_secs_f64(self.state.config.timeouts.idle);
        let max = self.state.config.limits.recv_buffer_bytes;
        loop {
            if !self.client_buf.is_empty() {
                let consumed = self.request.parse(&self.client_buf)?;
                let _ = self.client_buf.split_to(consumed);
                if self.request.is_complete() {
                    return Ok(true);
                }
            }
            let received = tokio::time::timeout(idle, self.client.recv(max))
                .await
                .map_err(|_| ProxyError::Timeout("client idle"))??;
            match received {
                None => {
                    if self.request.state() == crate::http::ParserState::Initialized
                        && self.client_buf.is_empty()
                    {
                        return Ok(false);
                    }
                    return Err(ProxyError::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "client closed mid-request",
                    )));
                }
                Some(raw) => {
                    // Request-head bytes go straight to the parser; the
                    // client-data hook observes traffic inside an
                    // established tunnel.
                    let raw = if self.phase == WorkPhase::Intercepting {
                        plugin::chain_client_data(
                            &mut self.protocol_plugins,
                            &mut self.client,
                            raw,
                        )
                    } else {
                        raw
                    };
                    self.client_buf.extend_from_slice(&raw);
                }
            }
        }
    }

    /// `CONNECT` routing: opaque tunnel when interception is off, otherwise
    /// the TLS man-in-the-middle pipeline.
    async fn handle_connect(&mut self) -> Result<(), ProxyError> {
        let url = self.request.url.clone().ok_or_else(|| {
            ProxyError::MalformedRequestTarget("CONNECT without authority".into())
        })?;
        let host = url.host_str().ok_or_else(|| {
            ProxyError::MalformedRequestTarget("CONNECT without host".into())
        })?;
        let port = url.port.unwrap_or(443);
        let (host, port) = plugin::chain_resolve_dns(&mut self.proxy_plugins, &host, port);

        if let Verdict::Suppress = plugin::chain_before_upstream_connection(
            &mut self.proxy_plugins,
            &mut self.request,
            &mut self.client,
        ) {
            self.finish_suppressed().await?;
            return Ok(());
        }

        let tcp = self.connect_upstream_tcp(&host, port).await?;
        let mut upstream = Connection::from_tcp(tcp, "upstream");

        if let Verdict::Suppress = plugin::chain_handle_client_request(
            &mut self.proxy_plugins,
            &mut self.request,
            &mut self.client,
        ) {
            upstream.shutdown().await;
            self.finish_suppressed().await?;
            return Ok(());
        }

        match self.state.interceptor.clone() {
            None => {
                self.client
                    .queue(Bytes::from_static(http::PROXY_TUNNEL_ESTABLISHED_RESPONSE));
                self.client.flush().await?;
                self.tunnel_established = true;
                self.phase = WorkPhase::TunnelEstablished;
                metrics::counter!("proxy_tunnels_total").increment(1);
                info!("tunnel: established, client={}, upstream={}:{}", self.peer, host, port);

                // The client may have sent tunnel bytes right behind the
                // CONNECT head.
                if !self.client_buf.is_empty() {
                    upstream.queue(self.client_buf.split().freeze());
                    upstream.flush().await?;
                }
                self.upstream = Some(upstream);
                self.upstream_addr = Some((host, port));
                pump_tunnel(
                    &self.state.config,
                    &mut self.client,
                    self.upstream.as_mut().unwrap(),
                    &mut self.protocol_plugins,
                    &mut self.proxy_plugins,
                )
                .await
            }
            Some(interceptor) => {
                let connect_timeout =
                    Duration::from_secs_f64(self.state.config.timeouts.upstream_connect);
                let name = tls::server_name(&host)?;
                tokio::time::timeout(
                    connect_timeout,
                    upstream.upgrade_client_tls(&self.state.connector, name),
                )
                .await
                .map_err(|_| {
                    ProxyError::UpstreamConnect(format!(
                        "tls handshake with {}:{} timed out",
                        host, port
                    ))
                })?
                .map_err(|e| {
                    ProxyError::UpstreamConnect(format!(
                        "tls handshake with {}:{}: {}",
                        host, port, e
                    ))
                })?;

                let acceptor = interceptor.acceptor_for(&host).await?;

                self.client
                    .queue(Bytes::from_static(http::PROXY_TUNNEL_ESTABLISHED_RESPONSE));
                self.client.flush().await?;
                self.tunnel_established = true;

                self.client.upgrade_server_tls(&acceptor).await?;
                // The wrapped stream speaks HTTP again; synthesized error
                // responses are valid from here on.
                self.tunnel_established = false;

                metrics::counter!("proxy_tls_intercepts_total").increment(1);
                info!(
                    "intercept: established, client={}, host={}, port={}",
                    self.peer, host, port
                );
                self.client_buf.clear();
                self.upstream = Some(upstream);
                self.upstream_addr = Some((host.clone(), port));
                self.connect_target = Some((host, port));
                self.phase = WorkPhase::Intercepting;
                Ok(())
            }
        }
    }

    /// Forward the parsed request upstream and stream the response back.
    /// Returns the upstream status code.
    async fn serve_proxy(&mut self) -> Result<u16, ProxyError> {
        let intercepting = self.phase == WorkPhase::Intercepting;
        if !intercepting {
            self.phase = WorkPhase::ProxyingPlain;
        }

        let (host, port, https) = if intercepting {
            let (host, port) = self
                .connect_target
                .clone()
                .expect("intercepting without a connect target");
            (host, port, true)
        } else {
            let url = self.request.url.as_ref().ok_or_else(|| {
                ProxyError::MalformedRequestTarget("proxy request without url".into())
            })?;
            let https = url.scheme.as_deref() == Some(b"https" as &[u8]);
            let host = url.host_str().ok_or_else(|| {
                ProxyError::MalformedRequestTarget("proxy request without host".into())
            })?;
            let port = url.port.unwrap_or(if https { 443 } else { 80 });
            (host, port, https)
        };
        let (host, port) = plugin::chain_resolve_dns(&mut self.proxy_plugins, &host, port);

        if let Verdict::Suppress = plugin::chain_before_upstream_connection(
            &mut self.proxy_plugins,
            &mut self.request,
            &mut self.client,
        ) {
            return self.finish_suppressed().await;
        }

        let reusable = self.upstream.is_some()
            && self.upstream_addr.as_ref() == Some(&(host.clone(), port));
        if !reusable {
            self.drop_upstream().await;
            let tcp = self.connect_upstream_tcp(&host, port).await?;
            let mut upstream = Connection::from_tcp(tcp, "upstream");
            if https {
                let connect_timeout =
                    Duration::from_secs_f64(self.state.config.timeouts.upstream_connect);
                let name = tls::server_name(&host)?;
                tokio::time::timeout(
                    connect_timeout,
                    upstream.upgrade_client_tls(&self.state.connector, name),
                )
                .await
                .map_err(|_| {
                    ProxyError::UpstreamConnect(format!(
                        "tls handshake with {}:{} timed out",
                        host, port
                    ))
                })?
                .map_err(|e| {
                    ProxyError::UpstreamConnect(format!(
                        "tls handshake with {}:{}: {}",
                        host, port, e
                    ))
                })?;
            }
            self.upstream = Some(upstream);
            self.upstream_addr = Some((host, port));
        }

        if let Verdict::Suppress = plugin::chain_handle_client_request(
            &mut self.proxy_plugins,
            &mut self.request,
            &mut self.client,
        ) {
            return self.finish_suppressed().await;
        }

        // Intercepted inner requests are already origin-form; absolute-form
        // proxy requests collapse to origin-form for the origin server.
        let raw = if intercepting {
            self.request.build()
        } else {
            self.request.build_upstream()
        };
        let upstream = self.upstream.as_mut().expect("upstream just connected");
        upstream.queue(raw);
        upstream.flush().await?;

        let mut response = HttpParser::response()
            .with_limits(
                self.state.config.limits.max_line_bytes,
                self.state.config.limits.max_header_bytes,
            )
            .set_streaming(true);
        stream_response(
            &self.state.config,
            &mut self.client,
            upstream,
            &mut self.protocol_plugins,
            &mut self.proxy_plugins,
            &mut response,
            &mut self.response_started,
        )
        .await?;

        let status = response.code.unwrap_or(0);
        if !response.is_reusable() {
            self.drop_upstream().await;
            self.close_after_exchange = true;
        }
        Ok(status)
    }

    /// Origin-form request nobody claimed: this proxy is not a web server
    /// for it.
    async fn serve_web(&mut self) -> Result<u16, ProxyError> {
        self.phase = WorkPhase::ServingWeb;
        self.client
            .queue(http::build_response(404, "Not Found", &[], b""));
        self.client.flush().await?;
        Ok(404)
    }

    /// A plugin suppressed the upstream leg. Whatever it queued goes out;
    /// with nothing queued the client gets a 502.
    async fn finish_suppressed(&mut self) -> Result<u16, ProxyError> {
        let status = if self.client.has_buffer() {
            0
        } else {
            self.client.queue(http::error_response(502, "Bad Gateway"));
            502
        };
        self.client.flush().await?;
        self.close_after_exchange = true;
        Ok(status)
    }

    async fn connect_upstream_tcp(&self, host: &str, port: u16) -> Result<TcpStream, ProxyError> {
        let connect_timeout =
            Duration::from_secs_f64(self.state.config.timeouts.upstream_connect);
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                ProxyError::UpstreamConnect(format!("connect to {}:{} timed out", host, port))
            })?
            .map_err(|e| ProxyError::UpstreamConnect(format!("{}:{}: {}", host, port, e)))?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    async fn drop_upstream(&mut self) {
        if let Some(mut upstream) = self.upstream.take() {
            upstream.shutdown().await;
            plugin::close_proxy_plugins(&mut self.proxy_plugins);
        }
        self.upstream_addr = None;
    }

    fn reset_exchange(&mut self) {
        self.request = new_request_parser(&self.state.config);
        self.response_started = false;
        self.close_after_exchange = false;
    }

    /// Map a failed work to its wire response, per the error taxonomy:
    /// client-side parse errors 400, upstream failures 502, interception
    /// failures 500; transport errors and timeouts close silently. Nothing
    /// is sent once response bytes or a tunnel reached the client.
    async fn fail(&mut self, e: &ProxyError) {
        match e {
            ProxyError::TlsIntercept(_) => {
                error!("work: tls interception failed, client={}, error={}", self.peer, e);
            }
            _ => warn!("work: failed, client={}, phase={:?}, error={}", self.peer, self.phase, e),
        }
        let status = if e.is_parse_error() {
            Some((400, "Bad Request"))
        } else {
            match e {
                ProxyError::UpstreamConnect(_) => Some((502, "Bad Gateway")),
                ProxyError::TlsIntercept(_) => Some((500, "Internal Server Error")),
                _ => None,
            }
        };
        if let Some((code, reason)) = status {
            if !self.response_started && !self.tunnel_established && !self.client.is_closed() {
                self.client.queue(http::error_response(code, reason));
                let _ = self.client.flush().await;
            }
            metrics::counter!(
                "proxy_http_requests_total",
                "status_code" => code.to_string(),
            )
            .increment(1);
        }
    }

    async fn teardown(&mut self) {
        self.drop_upstream().await;
        plugin::close_protocol_plugins(&mut self.protocol_plugins);
        self.client.shutdown().await;
        self.phase = WorkPhase::Closed;
    }

    /// One line per exchange. Status 0 marks a plugin-authored response
    /// whose status is opaque to the handler.
    fn log_access(&self, status: u16, started: Instant) {
        let method = self
            .request
            .method
            .as_deref()
            .map(|m| String::from_utf8_lossy(m).into_owned())
            .unwrap_or_default();
        let target = self
            .request
            .url
            .as_ref()
            .map(|u| u.to_string())
            .unwrap_or_default();
        metrics::counter!(
            "proxy_http_requests_total",
            "method" => method.clone(),
            "status_code" => status.to_string(),
        )
        .increment(1);
        info!(
            client = %self.peer,
            method = %method,
            target = %target,
            status = status,
            phase = ?self.phase,
            latency_ms = %started.elapsed().as_millis(),
            "access"
        );
    }
}

fn new_request_parser(config: &ProxyConfig) -> HttpParser {
    HttpParser::request().with_limits(config.limits.max_line_bytes, config.limits.max_header_bytes)
}

enum TunnelEvent {
    FromClient(Option<Bytes>),
    FromUpstream(Option<Bytes>),
    Idle,
}

/// Opaque bidirectional copy with plugin observation. Bytes pass through
/// the chunk hooks but are otherwise untouched; either side closing ends
/// the tunnel.
async fn pump_tunnel(
    config: &ProxyConfig,
    client: &mut Connection,
    upstream: &mut Connection,
    protocol_plugins: &mut [Box<dyn HttpProtocolHandlerPlugin>],
    proxy_plugins: &mut [Box<dyn HttpProxyBasePlugin>],
) -> Result<(), ProxyError> {
    let idle = Duration::from_secs_f64(config.timeouts.idle);
    let max = config.limits.recv_buffer_bytes;
    loop {
        let event = tokio::select! {
            r = client.recv(max) => TunnelEvent::FromClient(r?),
            r = upstream.recv(max) => TunnelEvent::FromUpstream(r?),
            _ = tokio::time::sleep(idle) => TunnelEvent::Idle,
        };
        match event {
            TunnelEvent::FromClient(None) | TunnelEvent::FromUpstream(None) => return Ok(()),
            TunnelEvent::FromClient(Some(raw)) => {
                let raw = plugin::chain_client_data(protocol_plugins, client, raw);
                upstream.queue(raw);
                upstream.flush().await?;
            }
            TunnelEvent::FromUpstream(Some(raw)) => {
                let raw = plugin::chain_upstream_chunk(proxy_plugins, raw);
                let raw = plugin::chain_response_chunk(protocol_plugins, raw);
                client.queue(raw);
                client.flush().await?;
            }
            TunnelEvent::Idle => return Err(ProxyError::Timeout("tunnel idle")),
        }
    }
}

/// Relay the upstream response to the client chunk by chunk. The raw wire
/// bytes are forwarded (after the rewrite hooks); a streaming response
/// parser rides along purely to track framing, so the handler knows when
/// the exchange ends and whether the connection stays reusable.
async fn stream_response(
    config: &ProxyConfig,
    client: &mut Connection,
    upstream: &mut Connection,
    protocol_plugins: &mut [Box<dyn HttpProtocolHandlerPlugin>],
    proxy_plugins: &mut [Box<dyn HttpProxyBasePlugin>],
    response: &mut HttpParser,
    response_started: &mut bool,
) -> Result<(), ProxyError> {
    let idle = Duration::from_secs_f64(config.timeouts.idle);
    let max = config.limits.recv_buffer_bytes;
    loop {
        let received = tokio::select! {
            r = upstream.recv(max) => r.map_err(ProxyError::Transport)?,
            _ = tokio::time::sleep(idle) => return Err(ProxyError::Timeout("upstream idle")),
        };
        match received {
            None => {
                response.mark_eof();
                if response.is_complete() {
                    return Ok(());
                }
                return Err(ProxyError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "upstream closed mid-response",
                )));
            }
            Some(raw) => {
                response.parse(&raw).map_err(|e| {
                    if e.is_parse_error() {
                        ProxyError::UpstreamConnect(format!("upstream protocol error: {}", e))
                    } else {
                        e
                    }
                })?;
                if response.is_streaming() {
                    let _ = response.take_body();
                }
                let chunk = plugin::chain_upstream_chunk(proxy_plugins, raw);
                let chunk = plugin::chain_response_chunk(protocol_plugins, chunk);
                *response_started = true;
                client.queue(chunk);
                client.flush().await?;
                if response.is_complete() {
                    return Ok(());
                }
            }
        }
    }
}
