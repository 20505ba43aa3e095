use std::path::Path;

use thiserror::Error;

mod schema;

pub use schema::{ExecutionConfig, OrchestratorConfig, RetryConfig, RetryKind, TemplateConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),

    #[error("config validation error: {message}")]
    Validation { message: String },
}

/// Load and validate an `OrchestratorConfig` from a TOML file path.
///
/// Returns the default config if the file does not exist.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(OrchestratorConfig::default());
    }

    let data = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.display().to_string(),
        source: e,
    })?;

    parse_config(&data)
}

/// Parse and validate an `OrchestratorConfig` from a TOML string.
pub fn parse_config(data: &str) -> Result<OrchestratorConfig, ConfigError> {
    let config: OrchestratorConfig = toml::from_str(data)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &OrchestratorConfig) -> Result<(), ConfigError> {
    if config.execution.default_timeout_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "execution.default_timeout_seconds must be > 0".to_string(),
        });
    }

    let r = &config.retry;
    if r.multiplier <= 1.0 {
        return Err(ConfigError::Validation {
            message: format!("retry.multiplier must be > 1.0, got {}", r.multiplier),
        });
    }

    if r.max_delay_ms < r.initial_delay_ms {
        return Err(ConfigError::Validation {
            message: "retry.max_delay_ms must be >= retry.initial_delay_ms".to_string(),
        });
    }

    if !(0.0..=1.0).contains(&r.jitter_factor) {
        return Err(ConfigError::Validation {
            message: format!(
                "retry.jitter_factor must be in [0, 1], got {}",
                r.jitter_factor
            ),
        });
    }

    Ok(())
}
