//! Configuration types and utilities

use crate::error::FirewallError;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Longest interface name the kernel accepts (IFNAMSIZ - 1).
const MAX_INTERFACE_LEN: usize = 15;

/// Parameters rendered into a redirect ruleset.
///
/// Immutable once rendered; loading a new one replaces the previous ruleset
/// wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectConfig {
    /// Interface whose outbound port 80/443 traffic is redirected
    pub interface_name: String,
    /// Local port of the plaintext listener
    pub proxy_http_port: u16,
    /// Local port of the TLS listener
    pub proxy_https_port: u16,
    /// Address the redirected packets are sent to
    pub proxy_address: IpAddr,
    /// Owner of the proxy process; its own traffic is never redirected
    pub proxy_user: String,
}

impl RedirectConfig {
    /// Build a config with the loopback address and `root` as proxy user.
    pub fn new(
        http_port: u16,
        https_port: u16,
        interface_name: impl Into<String>,
    ) -> Result<Self, FirewallError> {
        let config = Self {
            interface_name: interface_name.into(),
            proxy_http_port: http_port,
            proxy_https_port: https_port,
            proxy_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            proxy_user: "root".to_string(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_proxy_address(mut self, address: IpAddr) -> Self {
        self.proxy_address = address;
        self
    }

    pub fn with_proxy_user(mut self, user: impl Into<String>) -> Self {
        self.proxy_user = user.into();
        self
    }

    /// Reject interface and user names that could smuggle extra pf syntax.
    pub fn validate(&self) -> Result<(), FirewallError> {
        if !is_valid_identifier(&self.interface_name, MAX_INTERFACE_LEN) {
            return Err(FirewallError::InvalidInterface(self.interface_name.clone()));
        }
        if !is_valid_identifier(&self.proxy_user, 32) {
            return Err(FirewallError::Configuration {
                output: format!("invalid proxy user '{}'", self.proxy_user),
            });
        }
        Ok(())
    }
}

fn is_valid_identifier(value: &str, max_len: usize) -> bool {
    !value.is_empty()
        && value.len() <= max_len
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Location of the static certificate/key pair served by the TLS listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_file: PathBuf::from("./sslKeys/server.crt"),
            key_file: PathBuf::from("./sslKeys/server.key"),
        }
    }
}

/// Static Proxy Startup Configuration
/// These settings are set at startup and do not change during runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyStartupConfig {
    /// Address both listeners bind to
    pub listen_address: IpAddr,
    /// Plaintext HTTP listener port
    pub http_port: u16,
    /// TLS listener port
    pub https_port: u16,
    /// Admin API port (health/metrics); disabled when `None`
    pub admin_port: Option<u16>,
    /// Deadline applied to each exchange; none when `None`
    pub exchange_timeout_secs: Option<u64>,
    /// Certificate configuration
    pub tls: TlsConfig,
}

impl ProxyStartupConfig {
    pub fn exchange_timeout(&self) -> Option<Duration> {
        self.exchange_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for ProxyStartupConfig {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            http_port: 8000,
            https_port: 8001,
            admin_port: None,
            exchange_timeout_secs: None,
            tls: TlsConfig::default(),
        }
    }
}
