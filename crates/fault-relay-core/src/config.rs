//! Configuration structures for fault-relay.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Control API binding.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Data-plane limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Proxies populated at startup.
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
}

impl Config {
    /// Parse a TOML configuration document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        for proxy in &config.proxies {
            proxy.validate()?;
        }
        Ok(config)
    }

    /// Read and parse a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

/// Control API binding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind the control API.
    #[serde(default = "default_host")]
    pub host: String,

    /// Control API port.
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            api_port: default_api_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8474
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional).
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Data-plane limits shared by every proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Upstream dial timeout in milliseconds.
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Size of the read buffer used by each pump.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl LimitsConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout_ms(),
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_dial_timeout_ms() -> u64 {
    5000
}

fn default_buffer_size() -> usize {
    32 * 1024
}

/// Declarative definition of a single proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Unique proxy name.
    pub name: String,

    /// Address the proxy listens on, `host:port`.
    pub listen: String,

    /// Address every accepted connection is forwarded to, `host:port`.
    pub upstream: String,

    /// Whether the proxy accepts connections.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ProxyConfig {
    /// Check the name and both addresses are well formed.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidProxy("proxy name is required".into()));
        }
        parse_host_port(&self.listen)
            .map_err(|e| Error::InvalidProxy(format!("{}: listen {}", self.name, e)))?;
        parse_host_port(&self.upstream)
            .map_err(|e| Error::InvalidProxy(format!("{}: upstream {}", self.name, e)))?;
        Ok(())
    }
}

/// Parse a `host:port` string.
pub fn parse_host_port(target: &str) -> Result<(String, u16)> {
    let Some((host, port)) = target.rsplit_once(':') else {
        return Err(Error::AddressResolution(format!("Invalid address: {}", target)));
    };

    let port: u16 = port
        .parse()
        .map_err(|_| Error::AddressResolution(format!("Invalid port: {}", port)))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(Error::AddressResolution(format!("Missing host: {}", target)));
    }

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_document() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.api_port, 8474);
        assert_eq!(config.limits.dial_timeout_ms, 5000);
        assert!(config.proxies.is_empty());
    }

    #[test]
    fn proxies_parse_from_toml() {
        let config = Config::from_toml_str(
            r#"
            [logging]
            level = "debug"

            [[proxies]]
            name = "http_host"
            listen = "127.0.0.1:22220"
            upstream = "127.0.0.1:8080"

            [[proxies]]
            name = "redis"
            listen = "127.0.0.1:22221"
            upstream = "localhost:6379"
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.proxies.len(), 2);
        assert!(config.proxies[0].enabled);
        assert!(!config.proxies[1].enabled);
    }

    #[test]
    fn invalid_proxy_address_is_rejected() {
        let err = Config::from_toml_str(
            r#"
            [[proxies]]
            name = "broken"
            listen = "127.0.0.1"
            upstream = "127.0.0.1:80"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidProxy(_)));
    }

    #[test]
    fn parse_host_port_handles_ipv6() {
        assert_eq!(
            parse_host_port("[::1]:8080").unwrap(),
            ("::1".to_string(), 8080)
        );
        assert!(parse_host_port(":80").is_err());
        assert!(parse_host_port("host:http").is_err());
    }
}
