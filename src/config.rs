//! Configuration types and loading
//!
//! Configuration is a single YAML file selected with `--conf`. The section
//! names mirror the daemon's components: `server` for the control listener,
//! `dhcp` for the VIP pool, `resolver` for the etcd bridge, `tcpforward` /
//! `udpforward` for the transparent forwarders, and `plugin` for
//! application-level proxies.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Control-channel listener
    pub server: ServerConfig,

    /// VIP pool
    pub dhcp: DhcpConfig,

    /// Domain resolver bridge; empty endpoints disable it
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Transparent TCP forwarder
    pub tcpforward: TcpForwardConfig,

    /// Transparent UDP forwarder
    pub udpforward: UdpForwardConfig,

    /// Plugin name to plugin-specific configuration string
    #[serde(default)]
    pub plugin: HashMap<String, String>,

    /// Logging
    #[serde(default)]
    pub log: LogConfig,

    /// TUN device
    #[serde(default)]
    pub tun: TunConfig,
}

/// Control-channel listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address for client control connections
    pub listen: SocketAddr,

    /// Pre-shared key clients must present in their auth frame
    #[serde(rename = "authKey")]
    pub auth_key: String,

    /// Root domain under which generated sub-domains are registered
    pub domain: String,
}

/// VIP pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DhcpConfig {
    /// CIDR the pool hands addresses out of
    pub cidr: String,

    /// Gateway VIP; excluded from the pool, configured on the TUN
    /// interface externally
    pub ip: Ipv4Addr,
}

/// Resolver bridge configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResolverConfig {
    /// etcd endpoints; an empty list disables domain registration
    #[serde(rename = "etcdEndpoints", default)]
    pub etcd_endpoints: Vec<String>,
}

impl ResolverConfig {
    /// Whether the resolver bridge is enabled
    #[must_use]
    pub fn enabled(&self) -> bool {
        !self.etcd_endpoints.is_empty()
    }
}

/// Transparent TCP forwarder configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpForwardConfig {
    /// Transparent listen address (iptables TPROXY target)
    pub listen: SocketAddr,

    /// Per-read deadline on spliced sockets in seconds; 0 = unset
    #[serde(rename = "readTimeout", default)]
    pub read_timeout: u64,

    /// Per-write deadline on spliced sockets in seconds; 0 = unset
    #[serde(rename = "writeTimeout", default)]
    pub write_timeout: u64,
}

/// Transparent UDP forwarder configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UdpForwardConfig {
    /// Transparent listen address (iptables TPROXY target)
    pub listen: SocketAddr,

    /// Per-read deadline in seconds; 0 = unset
    #[serde(rename = "readTimeout", default)]
    pub read_timeout: u64,

    /// Per-write deadline in seconds; 0 = unset
    #[serde(rename = "writeTimeout", default)]
    pub write_timeout: u64,

    /// Seconds without traffic before a flow is swept
    #[serde(rename = "sessionTimeout", default = "default_session_timeout")]
    pub session_timeout: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// TUN device configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunConfig {
    /// Device name
    #[serde(default = "default_tun_name")]
    pub name: String,

    /// Device MTU
    #[serde(default = "default_tun_mtu")]
    pub mtu: u16,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            mtu: default_tun_mtu(),
        }
    }
}

fn default_session_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".into()
}

fn default_tun_name() -> String {
    "tunneld0".into()
}

fn default_tun_mtu() -> u16 {
    1500
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.auth_key.is_empty() {
            return Err(ConfigError::validation("server.authKey must not be empty"));
        }

        if self.server.domain.is_empty() {
            return Err(ConfigError::validation("server.domain must not be empty"));
        }

        let net: Ipv4Net = self
            .dhcp
            .cidr
            .parse()
            .map_err(|_| ConfigError::validation(format!("invalid dhcp.cidr: {}", self.dhcp.cidr)))?;

        if !net.contains(&self.dhcp.ip) {
            return Err(ConfigError::validation(format!(
                "dhcp.ip {} is outside dhcp.cidr {}",
                self.dhcp.ip, self.dhcp.cidr
            )));
        }

        if self.udpforward.session_timeout == 0 {
            return Err(ConfigError::validation(
                "udpforward.sessionTimeout must be greater than 0",
            ));
        }

        if self.tun.mtu < 576 {
            return Err(ConfigError::validation(format!(
                "tun.mtu {} is below the IPv4 minimum of 576",
                self.tun.mtu
            )));
        }

        Ok(())
    }
}

/// Load configuration from a YAML file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    load_config_str(&contents)
}

/// Load configuration from a YAML string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(yaml: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  listen: "0.0.0.0:9641"
  authKey: "client server exchange key"
  domain: "tunnel.example.com"
dhcp:
  cidr: "100.64.240.1/24"
  ip: "100.64.240.1"
resolver:
  etcdEndpoints:
    - "http://127.0.0.1:2379"
tcpforward:
  listen: "0.0.0.0:8884"
udpforward:
  listen: "0.0.0.0:8885"
  sessionTimeout: 30
plugin:
  tcp: ""
"#;

    #[test]
    fn test_parse_sample() {
        let cfg = load_config_str(SAMPLE).unwrap();
        assert_eq!(cfg.server.auth_key, "client server exchange key");
        assert_eq!(cfg.server.domain, "tunnel.example.com");
        assert_eq!(cfg.dhcp.ip, Ipv4Addr::new(100, 64, 240, 1));
        assert!(cfg.resolver.enabled());
        assert_eq!(cfg.udpforward.session_timeout, 30);
        assert!(cfg.plugin.contains_key("tcp"));
        // defaults
        assert_eq!(cfg.log.level, "info");
        assert_eq!(cfg.tun.name, "tunneld0");
        assert_eq!(cfg.tun.mtu, 1500);
        assert_eq!(cfg.tcpforward.read_timeout, 0);
    }

    #[test]
    fn test_resolver_disabled_when_absent() {
        let yaml = SAMPLE.replace(
            "resolver:\n  etcdEndpoints:\n    - \"http://127.0.0.1:2379\"\n",
            "",
        );
        let cfg = load_config_str(&yaml).unwrap();
        assert!(!cfg.resolver.enabled());
    }

    #[test]
    fn test_invalid_cidr_rejected() {
        let yaml = SAMPLE.replace("100.64.240.1/24", "not-a-cidr");
        let err = load_config_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_gateway_outside_cidr_rejected() {
        let yaml = SAMPLE.replace("ip: \"100.64.240.1\"", "ip: \"10.0.0.1\"");
        let err = load_config_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_zero_session_timeout_rejected() {
        let yaml = SAMPLE.replace("sessionTimeout: 30", "sessionTimeout: 0");
        let err = load_config_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config("/nonexistent/tunneld.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
