use crate::AgentError;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration for the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Whether to enable JSON formatted logs
    pub json_format: bool,

    /// Module-specific log levels
    pub module_levels: Vec<(String, String)>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            module_levels: vec![
                ("hyper".to_string(), "warn".to_string()),
                ("hyper_util".to_string(), "warn".to_string()),
                ("rustls".to_string(), "warn".to_string()),
            ],
        }
    }
}

/// Build the filter: `RUST_LOG` when set, otherwise the configured levels.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, AgentError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    if !levels::is_valid_level(&config.level) {
        return Err(AgentError::Logging(format!(
            "Invalid log level: {}",
            config.level
        )));
    }
    let mut filter = EnvFilter::new(&config.level);
    for (module, level) in &config.module_levels {
        let directive = format!("{}={}", module, level);
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|e| {
                    AgentError::Logging(format!("Invalid log directive {}: {}", directive, e))
                })?,
        );
    }
    Ok(filter)
}

/// Initialize logging based on the provided configuration
pub fn init_logging(config: &LoggingConfig) -> Result<(), AgentError> {
    let filter = build_filter(config)?;

    let json = config.json_format.then(|| fmt::layer().json().with_target(true));
    let text = (!config.json_format).then(|| fmt::layer().with_target(true));

    // Try to initialize logging, ignore if already initialized
    let result = tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init();

    match result {
        Ok(_) => tracing::debug!("Logging initialized with config level: {}", config.level),
        Err(_) => tracing::debug!("Logging already initialized, skipping"),
    }

    Ok(())
}

pub mod levels {
    /// Check if a log level string is valid
    pub fn is_valid_level(level: &str) -> bool {
        matches!(
            level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error" | "off"
        )
    }
}
