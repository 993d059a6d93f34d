//! Configuration loading from disk and environment.

use std::fs;
use std::path::Path;

use crate::config::schema::{AppConfig, BackendKind};
use crate::config::validation::{validate_config, ValidationError};

/// Selects the queue backend (`durable` or `memory`).
pub const ENV_QUEUE_BACKEND: &str = "RESEARCH_QUEUE_BACKEND";
/// Overrides the durable backend journal path.
pub const ENV_QUEUE_DATA_PATH: &str = "RESEARCH_QUEUE_DATA_PATH";
/// Overrides the admin API bearer token.
pub const ENV_ADMIN_API_KEY: &str = "RESEARCH_ADMIN_API_KEY";

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Env { var: &'static str, message: String },
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Env { var, message } => write!(f, "Invalid {}: {}", var, message),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    let config: AppConfig = toml::from_str(&content).map_err(ConfigError::Parse)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Load the file when given (defaults otherwise), apply environment
/// overrides, then validate the result.
pub fn load_with_env(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => AppConfig::default(),
    };

    apply_env_overrides(&mut config, |var| std::env::var(var).ok())?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Apply overrides from a variable lookup (the process environment in production).
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(ENV_QUEUE_BACKEND) {
        config.queue.backend = value
            .parse::<BackendKind>()
            .map_err(|message| ConfigError::Env {
                var: ENV_QUEUE_BACKEND,
                message,
            })?;
    }

    if let Some(path) = lookup(ENV_QUEUE_DATA_PATH) {
        config.queue.data_path = path;
    }

    if let Some(key) = lookup(ENV_ADMIN_API_KEY) {
        config.admin.api_key = key;
    }

    Ok(())
}
