use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::error::ProxyError;
use crate::http::HttpParser;
use crate::net::Connection;

pub const CAPABILITY_PROTOCOL: &str = "HttpProtocolHandlerPlugin";
pub const CAPABILITY_PROXY: &str = "HttpProxyBasePlugin";

/// Outcome of the request-complete hook chain.
pub enum RequestAction {
    /// Proceed to routing (web / proxy / tunnel).
    Continue,
    /// Tear the connection down without replying.
    Drop,
    /// Short-circuit with this raw response; upstream dispatch is skipped.
    Respond(Bytes),
}

/// Outcome of a request-shaping proxy hook.
pub enum Verdict {
    Continue,
    /// Skip the upstream connection for this request. The plugin is
    /// expected to have queued a response on the client connection;
    /// otherwise the handler replies 502.
    Suppress,
}

/// Hooks attached to every work, regardless of mode. Hooks are synchronous
/// and must not block; connections are borrowed only for the duration of a
/// call.
pub trait HttpProtocolHandlerPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Observe/rewrite raw client bytes read while tunnelling. Not invoked
    /// for bytes that form the request head.
    fn on_client_data(
        &mut self,
        _client: &mut Connection,
        raw: Bytes,
    ) -> Result<Bytes, ProxyError> {
        Ok(raw)
    }

    /// Fires once the request parser reports COMPLETE.
    fn on_request_complete(
        &mut self,
        _client: &mut Connection,
        _request: &mut HttpParser,
    ) -> Result<RequestAction, ProxyError> {
        Ok(RequestAction::Continue)
    }

    /// Observe/rewrite each response chunk on its way to the client.
    fn on_response_chunk(&mut self, chunk: Bytes) -> Result<Bytes, ProxyError> {
        Ok(chunk)
    }

    fn on_client_connection_close(&mut self) {}
}

/// Hooks attached to proxy-mode works only.
pub trait HttpProxyBasePlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Override the upstream address. The first plugin returning `Some`
    /// wins.
    fn resolve_dns(
        &mut self,
        _host: &str,
        _port: u16,
    ) -> Result<Option<(String, u16)>, ProxyError> {
        Ok(None)
    }

    /// Runs before the upstream socket is opened.
    fn before_upstream_connection(
        &mut self,
        _request: &mut HttpParser,
        _client: &mut Connection,
    ) -> Result<Verdict, ProxyError> {
        Ok(Verdict::Continue)
    }

    /// Runs after the upstream is connected, before the request is sent.
    fn handle_client_request(
        &mut self,
        _request: &mut HttpParser,
        _client: &mut Connection,
    ) -> Result<Verdict, ProxyError> {
        Ok(Verdict::Continue)
    }

    /// Observe/rewrite each upstream chunk before the protocol-handler
    /// plugins see it.
    fn handle_upstream_chunk(&mut self, chunk: Bytes) -> Result<Bytes, ProxyError> {
        Ok(chunk)
    }

    fn on_upstream_connection_close(&mut self) {}
}

pub type ProtocolPluginFactory =
    Arc<dyn Fn() -> Box<dyn HttpProtocolHandlerPlugin> + Send + Sync>;
pub type ProxyPluginFactory = Arc<dyn Fn() -> Box<dyn HttpProxyBasePlugin> + Send + Sync>;

/// Frozen, ordered plugin factories for both capability sets. Each work
/// instantiates fresh plugin instances from these, so hook state is
/// per-connection.
#[derive(Default)]
pub struct PluginRegistry {
    protocol: Vec<ProtocolPluginFactory>,
    proxy: Vec<ProxyPluginFactory>,
}

impl PluginRegistry {
    pub fn builder() -> PluginRegistryBuilder {
        PluginRegistryBuilder::default()
    }

    pub fn instantiate_protocol(&self) -> Vec<Box<dyn HttpProtocolHandlerPlugin>> {
        self.protocol.iter().map(|f| f()).collect()
    }

    pub fn instantiate_proxy(&self) -> Vec<Box<dyn HttpProxyBasePlugin>> {
        self.proxy.iter().map(|f| f()).collect()
    }
}

/// Builder-style registration: `provide_*` adds a named factory to the
/// catalog, `enable_from_config` selects catalog entries by the configured
/// name lists, and `enable_*` appends a factory directly (tests, embedders).
#[derive(Default)]
pub struct PluginRegistryBuilder {
    catalog_protocol: HashMap<String, ProtocolPluginFactory>,
    catalog_proxy: HashMap<String, ProxyPluginFactory>,
    protocol: Vec<ProtocolPluginFactory>,
    proxy: Vec<ProxyPluginFactory>,
}

impl PluginRegistryBuilder {
    pub fn provide_protocol(mut self, name: &str, factory: ProtocolPluginFactory) -> Self {
        self.catalog_protocol.insert(name.to_string(), factory);
        self
    }

    pub fn provide_proxy(mut self, name: &str, factory: ProxyPluginFactory) -> Self {
        self.catalog_proxy.insert(name.to_string(), factory);
        self
    }

    pub fn enable_protocol(mut self, factory: ProtocolPluginFactory) -> Self {
        self.protocol.push(factory);
        self
    }

    pub fn enable_proxy(mut self, factory: ProxyPluginFactory) -> Self {
        self.proxy.push(factory);
        self
    }

    /// Resolve the configured capability→names map against the catalog, in
    /// the configured order. Unknown capability keys or plugin names are a
    /// configuration error.
    pub fn enable_from_config(
        mut self,
        plugins: &HashMap<String, Vec<String>>,
    ) -> Result<Self, ProxyError> {
        for (capability, names) in plugins {
            match capability.as_str() {
                CAPABILITY_PROTOCOL => {
                    for name in names {
                        let factory = self.catalog_protocol.get(name).cloned().ok_or_else(|| {
                            ProxyError::Config(format!("unknown protocol plugin: {}", name))
                        })?;
                        self.protocol.push(factory);
                    }
                }
                CAPABILITY_PROXY => {
                    for name in names {
                        let factory = self.catalog_proxy.get(name).cloned().ok_or_else(|| {
                            ProxyError::Config(format!("unknown proxy plugin: {}", name))
                        })?;
                        self.proxy.push(factory);
                    }
                }
                other => {
                    return Err(ProxyError::Config(format!(
                        "unknown plugin capability: {}",
                        other
                    )));
                }
            }
        }
        Ok(self)
    }

    pub fn build(self) -> PluginRegistry {
        PluginRegistry {
            protocol: self.protocol,
            proxy: self.proxy,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch — ordered invocation with the error policy from the design:
// a failing rewrite hook is logged and treated as the identity transform;
// lifecycle close hooks are best-effort.
// ---------------------------------------------------------------------------

pub fn chain_client_data(
    plugins: &mut [Box<dyn HttpProtocolHandlerPlugin>],
    client: &mut Connection,
    raw: Bytes,
) -> Bytes {
    let mut current = raw;
    for plugin in plugins.iter_mut() {
        match plugin.on_client_data(client, current.clone()) {
            Ok(rewritten) => current = rewritten,
            Err(e) => warn!("plugin: on_client_data failed, plugin={}, error={}", plugin.name(), e),
        }
    }
    current
}

/// First non-`Continue` action short-circuits the chain. A hook error is
/// treated as "continue to upstream with the unmodified request".
pub fn chain_request_complete(
    plugins: &mut [Box<dyn HttpProtocolHandlerPlugin>],
    client: &mut Connection,
    request: &mut HttpParser,
) -> RequestAction {
    for plugin in plugins.iter_mut() {
        match plugin.on_request_complete(client, request) {
            Ok(RequestAction::Continue) => {}
            Ok(action) => return action,
            Err(e) => warn!(
                "plugin: on_request_complete failed, plugin={}, error={}",
                plugin.name(),
                e
            ),
        }
    }
    RequestAction::Continue
}

pub fn chain_response_chunk(
    plugins: &mut [Box<dyn HttpProtocolHandlerPlugin>],
    chunk: Bytes,
) -> Bytes {
    let mut current = chunk;
    for plugin in plugins.iter_mut() {
        match plugin.on_response_chunk(current.clone()) {
            Ok(rewritten) => current = rewritten,
            Err(e) => warn!(
                "plugin: on_response_chunk failed, plugin={}, error={}",
                plugin.name(),
                e
            ),
        }
    }
    current
}

pub fn chain_upstream_chunk(
    plugins: &mut [Box<dyn HttpProxyBasePlugin>],
    chunk: Bytes,
) -> Bytes {
    let mut current = chunk;
    for plugin in plugins.iter_mut() {
        match plugin.handle_upstream_chunk(current.clone()) {
            Ok(rewritten) => current = rewritten,
            Err(e) => warn!(
                "plugin: handle_upstream_chunk failed, plugin={}, error={}",
                plugin.name(),
                e
            ),
        }
    }
    current
}

pub fn chain_resolve_dns(
    plugins: &mut [Box<dyn HttpProxyBasePlugin>],
    host: &str,
    port: u16,
) -> (String, u16) {
    for plugin in plugins.iter_mut() {
        match plugin.resolve_dns(host, port) {
            Ok(Some((host, port))) => return (host, port),
            Ok(None) => {}
            Err(e) => warn!(
                "plugin: resolve_dns failed, plugin={}, error={}",
                plugin.name(),
                e
            ),
        }
    }
    (host.to_string(), port)
}

pub fn chain_before_upstream_connection(
    plugins: &mut [Box<dyn HttpProxyBasePlugin>],
    request: &mut HttpParser,
    client: &mut Connection,
) -> Verdict {
    for plugin in plugins.iter_mut() {
        match plugin.before_upstream_connection(request, client) {
            Ok(Verdict::Continue) => {}
            Ok(Verdict::Suppress) => return Verdict::Suppress,
            Err(e) => warn!(
                "plugin: before_upstream_connection failed, plugin={}, error={}",
                plugin.name(),
                e
            ),
        }
    }
    Verdict::Continue
}

pub fn chain_handle_client_request(
    plugins: &mut [Box<dyn HttpProxyBasePlugin>],
    request: &mut HttpParser,
    client: &mut Connection,
) -> Verdict {
    for plugin in plugins.iter_mut() {
        match plugin.handle_client_request(request, client) {
            Ok(Verdict::Continue) => {}
            Ok(Verdict::Suppress) => return Verdict::Suppress,
            Err(e) => warn!(
                "plugin: handle_client_request failed, plugin={}, error={}",
                plugin.name(),
                e
            ),
        }
    }
    Verdict::Continue
}

pub fn close_protocol_plugins(plugins: &mut [Box<dyn HttpProtocolHandlerPlugin>]) {
    for plugin in plugins.iter_mut() {
        plugin.on_client_connection_close();
    }
}

pub fn close_proxy_plugins(plugins: &mut [Box<dyn HttpProxyBasePlugin>]) {
    for plugin in plugins.iter_mut() {
        plugin.on_upstream_connection_close();
    }
}
