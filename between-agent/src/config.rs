//! Layered agent configuration.
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML
//! file, `BETWEEN_*` environment variables, explicit command-line flags.

use crate::logging::LoggingConfig;
use crate::Args;
use between_core::{ProxyStartupConfig, RedirectConfig, TlsConfig};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const ENV_PREFIX: &str = "BETWEEN_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid {key} value '{value}'")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Fully resolved settings for one agent run.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub redirect: RedirectConfig,
    pub proxy: ProxyStartupConfig,
    pub capture_dir: Option<PathBuf>,
    pub logging: LoggingConfig,
    /// Install the packet-filter redirect; off with `--no-redirect`
    pub redirect_enabled: bool,
    /// Print the rendered ruleset and exit
    pub print_rules: bool,
}

/// One configuration source. Every field is optional so layers can be
/// stacked; unset fields fall through to the layer below.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    pub interface: Option<String>,
    pub http_port: Option<u16>,
    pub https_port: Option<u16>,
    pub proxy_address: Option<IpAddr>,
    pub proxy_user: Option<String>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub admin_port: Option<u16>,
    pub exchange_timeout_secs: Option<u64>,
    pub capture_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_json: Option<bool>,
}

impl ConfigLayer {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Read `BETWEEN_*` variables through `lookup`.
    pub fn from_env<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        Ok(Self {
            interface: get("INTERFACE"),
            http_port: parse_env(&lookup, "HTTP_PORT")?,
            https_port: parse_env(&lookup, "HTTPS_PORT")?,
            proxy_address: parse_env(&lookup, "PROXY_ADDRESS")?,
            proxy_user: get("PROXY_USER"),
            cert_file: get("CERT_FILE").map(PathBuf::from),
            key_file: get("KEY_FILE").map(PathBuf::from),
            admin_port: parse_env(&lookup, "ADMIN_PORT")?,
            exchange_timeout_secs: parse_env(&lookup, "EXCHANGE_TIMEOUT_SECS")?,
            capture_dir: get("CAPTURE_DIR").map(PathBuf::from),
            log_level: get("LOG_LEVEL"),
            log_json: parse_env(&lookup, "LOG_JSON")?,
        })
    }

    pub fn from_args(args: &Args) -> Self {
        Self {
            interface: args.interface.clone(),
            http_port: args.http_port,
            https_port: args.https_port,
            proxy_address: args.proxy_address,
            proxy_user: args.proxy_user.clone(),
            cert_file: args.cert_file.clone(),
            key_file: args.key_file.clone(),
            admin_port: args.admin_port,
            exchange_timeout_secs: args.exchange_timeout_secs,
            capture_dir: args.capture_dir.clone(),
            log_level: args.log_level.clone(),
            log_json: args.log_json.then_some(true),
        }
    }

    /// Overlay `higher` on top of `self`.
    pub fn merge(self, higher: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            interface: higher.interface.or(self.interface),
            http_port: higher.http_port.or(self.http_port),
            https_port: higher.https_port.or(self.https_port),
            proxy_address: higher.proxy_address.or(self.proxy_address),
            proxy_user: higher.proxy_user.or(self.proxy_user),
            cert_file: higher.cert_file.or(self.cert_file),
            key_file: higher.key_file.or(self.key_file),
            admin_port: higher.admin_port.or(self.admin_port),
            exchange_timeout_secs: higher.exchange_timeout_secs.or(self.exchange_timeout_secs),
            capture_dir: higher.capture_dir.or(self.capture_dir),
            log_level: higher.log_level.or(self.log_level),
            log_json: higher.log_json.or(self.log_json),
        }
    }
}

fn parse_env<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let key = format!("{}{}", ENV_PREFIX, name);
    match lookup(&key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value }),
        None => Ok(None),
    }
}

/// Resolve configuration from the process environment.
pub fn load_agent_config(args: &Args) -> Result<AgentConfig, ConfigError> {
    load_agent_config_with(args, |key| std::env::var(key).ok())
}

/// Resolve configuration with an explicit environment lookup.
pub fn load_agent_config_with<F>(args: &Args, env: F) -> Result<AgentConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut layer = ConfigLayer::default();
    if let Some(path) = &args.config {
        layer = layer.merge(ConfigLayer::from_file(path)?);
    }
    layer = layer
        .merge(ConfigLayer::from_env(env)?)
        .merge(ConfigLayer::from_args(args));

    resolve(layer, args)
}

fn resolve(layer: ConfigLayer, args: &Args) -> Result<AgentConfig, ConfigError> {
    let proxy_defaults = ProxyStartupConfig::default();
    let tls_defaults = TlsConfig::default();

    let http_port = layer.http_port.unwrap_or(proxy_defaults.http_port);
    let https_port = layer.https_port.unwrap_or(proxy_defaults.https_port);
    let proxy_address = layer.proxy_address.unwrap_or(proxy_defaults.listen_address);

    let mut redirect = RedirectConfig::new(
        http_port,
        https_port,
        layer.interface.unwrap_or_else(|| "tap0".to_string()),
    )
    .map_err(|e| ConfigError::Invalid(e.to_string()))?
    .with_proxy_address(proxy_address);
    if let Some(user) = layer.proxy_user {
        redirect = redirect.with_proxy_user(user);
        redirect
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
    }

    if http_port == https_port && http_port != 0 {
        return Err(ConfigError::Invalid(format!(
            "HTTP and HTTPS listeners cannot share port {}",
            http_port
        )));
    }
    if layer.exchange_timeout_secs == Some(0) {
        return Err(ConfigError::Invalid(
            "exchange timeout must be at least one second".into(),
        ));
    }

    let proxy = ProxyStartupConfig {
        listen_address: proxy_address,
        http_port,
        https_port,
        admin_port: layer.admin_port,
        exchange_timeout_secs: layer.exchange_timeout_secs,
        tls: TlsConfig {
            cert_file: layer.cert_file.unwrap_or(tls_defaults.cert_file),
            key_file: layer.key_file.unwrap_or(tls_defaults.key_file),
        },
    };

    let mut logging = LoggingConfig::default();
    if let Some(level) = layer.log_level {
        logging.level = level;
    }
    if let Some(json) = layer.log_json {
        logging.json_format = json;
    }

    Ok(AgentConfig {
        redirect,
        proxy,
        capture_dir: layer.capture_dir,
        logging,
        redirect_enabled: !args.no_redirect,
        print_rules: args.print_rules,
    })
}
