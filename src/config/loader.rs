//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::ShellConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    ParseJson(serde_json::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::ParseJson(e) => write!(f, "Parse error: {}", e),
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

/// Load and validate configuration. Files ending in `.json` are read as JSON,
/// everything else as TOML.
pub fn load_config(path: &Path) -> Result<ShellConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    let is_json = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
    let config = parse_config(&content, is_json)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Top-level sections of [`ShellConfig`].
const SECTIONS: [&str; 5] = ["ledger", "protocol", "retries", "executor", "observability"];

fn parse_config(content: &str, is_json: bool) -> Result<ShellConfig, ConfigError> {
    if is_json {
        parse_json(content)
    } else {
        toml::from_str(content).map_err(ConfigError::Parse)
    }
}

/// JSON files may also use the flat legacy shape
/// `{"endpoint", "contract_address", "private_key"}`, which has no sections
/// and describes the ledger alone.
fn parse_json(content: &str) -> Result<ShellConfig, ConfigError> {
    let value: serde_json::Value = serde_json::from_str(content).map_err(ConfigError::ParseJson)?;
    let is_flat = value
        .as_object()
        .map_or(false, |fields| !fields.keys().any(|k| SECTIONS.contains(&k.as_str())));

    if is_flat {
        Ok(ShellConfig {
            ledger: serde_json::from_value(value).map_err(ConfigError::ParseJson)?,
            ..ShellConfig::default()
        })
    } else {
        serde_json::from_value(value).map_err(ConfigError::ParseJson)
    }
}
