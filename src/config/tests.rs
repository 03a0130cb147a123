use super::ProxyConfig;
use std::path::Path;

use crate::error::ProxyError;

#[test]
fn test_missing_file_uses_defaults() {
    let cfg = ProxyConfig::load(Path::new("/nonexistent/janus.toml")).unwrap();
    assert_eq!(cfg.hostname, "127.0.0.1");
    assert_eq!(cfg.port, 8899);
    assert_eq!(cfg.backlog, 1024);
    assert!(!cfg.threaded);
    assert!(!cfg.tls_interception_enabled());
}

#[test]
fn test_load_toml_config() {
    let toml = r#"
hostname = "0.0.0.0"
port = 8080
backlog = 128

[timeouts]
idle = 5.0

[limits]
max_line_bytes = 4096
"#;
    let tmp = std::env::temp_dir().join("janus_test_config.toml");
    std::fs::write(&tmp, toml).unwrap();
    let cfg = ProxyConfig::load(&tmp).unwrap();
    assert_eq!(cfg.hostname, "0.0.0.0");
    assert_eq!(cfg.port, 8080);
    assert_eq!(cfg.backlog, 128);
    assert_eq!(cfg.timeouts.idle, 5.0);
    assert_eq!(cfg.limits.max_line_bytes, 4096);
    // Untouched sections keep their defaults.
    assert_eq!(cfg.timeouts.upstream_connect, 10.0);
    assert_eq!(cfg.limits.max_header_bytes, 64 * 1024);
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "hostname": "::1",
        "port": 3128,
        "plugins": {
            "HttpProxyBasePlugin": ["shortlink"]
        }
    }"#;
    let tmp = std::env::temp_dir().join("janus_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = ProxyConfig::load(&tmp).unwrap();
    assert_eq!(cfg.hostname, "::1");
    assert_eq!(cfg.port, 3128);
    assert_eq!(
        cfg.plugins.get("HttpProxyBasePlugin").unwrap(),
        &vec!["shortlink".to_string()]
    );
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_unsupported_extension_fails() {
    let tmp = std::env::temp_dir().join("janus_test_config.yaml");
    std::fs::write(&tmp, "hostname: x").unwrap();
    assert!(matches!(
        ProxyConfig::load(&tmp),
        Err(ProxyError::Config(_))
    ));
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_validate_partial_ca_material_fails() {
    let cfg = ProxyConfig {
        ca_cert_file: Some("ca.pem".into()),
        ..ProxyConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_interception_requires_cache_dir() {
    let cfg = ProxyConfig {
        ca_cert_file: Some("ca.pem".into()),
        ca_key_file: Some("ca-key.pem".into()),
        ca_signing_key_file: Some("signing.pem".into()),
        ca_cert_dir: None,
        ..ProxyConfig::default()
    };
    assert!(cfg.validate().is_err());

    let cfg = ProxyConfig {
        ca_cert_dir: Some("/tmp/certs".into()),
        ..cfg
    };
    assert!(cfg.validate().is_ok());
    assert!(cfg.tls_interception_enabled());
}

#[test]
fn test_validate_rejects_unknown_capability() {
    let mut cfg = ProxyConfig::default();
    cfg.plugins
        .insert("NotACapability".to_string(), vec!["x".to_string()]);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_rejects_non_ip_hostname() {
    let cfg = ProxyConfig {
        hostname: "localhost".to_string(),
        ..ProxyConfig::default()
    };
    assert!(cfg.validate().is_err());

    // A unix socket bind does not use the hostname.
    let cfg = ProxyConfig {
        hostname: "localhost".to_string(),
        unix_socket_path: Some("/tmp/janus.sock".into()),
        ..ProxyConfig::default()
    };
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_rejects_zero_limits() {
    let mut cfg = ProxyConfig::default();
    cfg.limits.max_line_bytes = 0;
    assert!(cfg.validate().is_err());
}
