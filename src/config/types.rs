use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Bind address; its IP version selects AF_INET vs AF_INET6.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// TCP port; 0 requests an OS-assigned port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// When set, overrides the TCP bind and listens on AF_UNIX instead.
    #[serde(default)]
    pub unix_socket_path: Option<PathBuf>,

    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// CA certificate used as the issuer of minted leaf certificates.
    #[serde(default)]
    pub ca_cert_file: Option<PathBuf>,

    /// Private key of `ca_cert_file`.
    #[serde(default)]
    pub ca_key_file: Option<PathBuf>,

    /// Keypair every minted leaf certificate is issued for; also the
    /// private key of the client-facing TLS server during interception.
    #[serde(default)]
    pub ca_signing_key_file: Option<PathBuf>,

    /// Leaf-certificate cache directory, one `<host>.pem` per hostname.
    #[serde(default)]
    pub ca_cert_dir: Option<PathBuf>,

    /// Trust-anchor bundle for verifying upstream TLS servers. Defaults to
    /// the bundled webpki roots when unset.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,

    /// Multi-thread runtime (one OS thread pool across works) vs a single
    /// cooperative thread multiplexing every work.
    #[serde(default)]
    pub threaded: bool,

    /// Pool size for `threaded` mode; unset means size from the cgroup CPU
    /// quota, falling back to host parallelism.
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Capability name → ordered list of registered plugin names.
    #[serde(default)]
    pub plugins: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub limits: LimitConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: default_port(),
            unix_socket_path: None,
            backlog: default_backlog(),
            ca_cert_file: None,
            ca_key_file: None,
            ca_signing_key_file: None,
            ca_cert_dir: None,
            ca_file: None,
            threaded: false,
            worker_threads: None,
            plugins: HashMap::new(),
            timeouts: TimeoutConfig::default(),
            limits: LimitConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Interception requires the full CA material set; with any of the
    /// three missing, `CONNECT` falls back to an opaque tunnel.
    pub fn tls_interception_enabled(&self) -> bool {
        self.ca_cert_file.is_some()
            && self.ca_key_file.is_some()
            && self.ca_signing_key_file.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Seconds a work may sit with no readable or writable progress.
    #[serde(default = "default_idle_timeout")]
    pub idle: f64,

    /// Seconds allowed for the upstream TCP connect (and TLS handshake
    /// when intercepting).
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle: default_idle_timeout(),
            upstream_connect: default_upstream_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Longest accepted request/status line.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    /// Largest accepted header block.
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,

    /// Read size per recv call.
    #[serde(default = "default_recv_buffer_bytes")]
    pub recv_buffer_bytes: usize,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: default_max_line_bytes(),
            max_header_bytes: default_max_header_bytes(),
            recv_buffer_bytes: default_recv_buffer_bytes(),
        }
    }
}

fn default_hostname() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8899
}

fn default_backlog() -> u32 {
    1024
}

fn default_idle_timeout() -> f64 {
    30.0
}

fn default_upstream_connect_timeout() -> f64 {
    10.0
}

fn default_max_line_bytes() -> usize {
    8 * 1024
}

fn default_max_header_bytes() -> usize {
    64 * 1024
}

fn default_recv_buffer_bytes() -> usize {
    128 * 1024
}
