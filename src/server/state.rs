use std::sync::Arc;

use tokio_rustls::TlsConnector;

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::plugin::PluginRegistry;
use crate::tls::{self, TlsInterceptor};

/// Shared proxy state, cheaply cloneable into every work.
///
/// Everything here is read-only after startup; the leaf-cert cache inside
/// the interceptor is the only cross-work mutable resource and mediates its
/// own access.
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<ProxyConfig>,
    /// Upstream TLS client configuration, shared by all works.
    pub connector: TlsConnector,
    /// Present when the CA material is configured; `CONNECT` falls back to
    /// opaque tunnelling without it.
    pub interceptor: Option<Arc<TlsInterceptor>>,
    pub plugins: Arc<PluginRegistry>,
}

impl ProxyState {
    pub fn new(config: ProxyConfig, plugins: PluginRegistry) -> Result<Self, ProxyError> {
        let connector = tls::upstream_connector(config.ca_file.as_deref())?;
        let interceptor = if config.tls_interception_enabled() {
            Some(Arc::new(TlsInterceptor::new(&config)?))
        } else {
            None
        };
        Ok(Self {
            config: Arc::new(config),
            connector,
            interceptor,
            plugins: Arc::new(plugins),
        })
    }
}
