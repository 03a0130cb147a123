pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use std::path::Path;

use crate::error::ProxyError;
use crate::plugin::{CAPABILITY_PROTOCOL, CAPABILITY_PROXY};

impl ProxyConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — the proxy starts with zero configuration for local use.
    pub fn load(path: &Path) -> Result<Self, ProxyError> {
        let mut config: ProxyConfig = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| ProxyError::Config(format!("{}: {}", path.display(), e)))?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)
                    .map_err(|e| ProxyError::Config(format!("{}: {}", path.display(), e)))?,
                Some("json") => serde_json::from_str(&content)
                    .map_err(|e| ProxyError::Config(format!("{}: {}", path.display(), e)))?,
                Some(ext) => {
                    return Err(ProxyError::Config(format!(
                        "unsupported config format: .{}, use .toml or .json",
                        ext
                    )));
                }
                None => {
                    return Err(ProxyError::Config(
                        "config file has no extension, use .toml or .json".to_string(),
                    ));
                }
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            ProxyConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variable overrides for deployment settings.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("JANUS_HOSTNAME") {
            self.hostname = v;
        }
        if let Ok(v) = std::env::var("JANUS_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.port = n;
            }
        }
        if let Ok(v) = std::env::var("JANUS_UNIX_SOCKET_PATH") {
            self.unix_socket_path = Some(v.into());
        }
        if let Ok(v) = std::env::var("JANUS_BACKLOG") {
            if let Ok(n) = v.parse::<u32>() {
                self.backlog = n;
            }
        }
        if let Ok(v) = std::env::var("JANUS_CA_CERT_FILE") {
            self.ca_cert_file = Some(v.into());
        }
        if let Ok(v) = std::env::var("JANUS_CA_KEY_FILE") {
            self.ca_key_file = Some(v.into());
        }
        if let Ok(v) = std::env::var("JANUS_CA_SIGNING_KEY_FILE") {
            self.ca_signing_key_file = Some(v.into());
        }
        if let Ok(v) = std::env::var("JANUS_CA_CERT_DIR") {
            self.ca_cert_dir = Some(v.into());
        }
        if let Ok(v) = std::env::var("JANUS_CA_FILE") {
            self.ca_file = Some(v.into());
        }
        if let Ok(v) = std::env::var("JANUS_THREADED") {
            self.threaded = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("JANUS_WORKER_THREADS") {
            if let Ok(n) = v.parse::<usize>() {
                self.worker_threads = Some(n);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        let ca_flags = [
            self.ca_cert_file.is_some(),
            self.ca_key_file.is_some(),
            self.ca_signing_key_file.is_some(),
        ];
        if ca_flags.iter().any(|&set| set) && !ca_flags.iter().all(|&set| set) {
            return Err(ProxyError::Config(
                "ca_cert_file, ca_key_file and ca_signing_key_file must be set together"
                    .to_string(),
            ));
        }
        if self.tls_interception_enabled() && self.ca_cert_dir.is_none() {
            return Err(ProxyError::Config(
                "ca_cert_dir is required when TLS interception is enabled".to_string(),
            ));
        }
        if self.unix_socket_path.is_none() && self.hostname.parse::<std::net::IpAddr>().is_err() {
            return Err(ProxyError::Config(format!(
                "hostname must be an IP address, got {}",
                self.hostname
            )));
        }
        for capability in self.plugins.keys() {
            if capability != CAPABILITY_PROTOCOL && capability != CAPABILITY_PROXY {
                return Err(ProxyError::Config(format!(
                    "unknown plugin capability: {}",
                    capability
                )));
            }
        }
        if self.limits.max_line_bytes == 0
            || self.limits.max_header_bytes == 0
            || self.limits.recv_buffer_bytes == 0
        {
            return Err(ProxyError::Config("limits must be non-zero".to_string()));
        }
        if self.timeouts.idle <= 0.0 || self.timeouts.upstream_connect <= 0.0 {
            return Err(ProxyError::Config("timeouts must be positive".to_string()));
        }
        Ok(())
    }
}
