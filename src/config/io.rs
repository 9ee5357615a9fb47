//! Configuration I/O - Loading and saving configuration
//!
//! Handles reading configuration from files and environment variables.

use std::path::Path;

use secrecy::{ExposeSecret, SecretString};

use super::types::Config;
use crate::error::{Error, Result};

/// Load configuration with layered precedence:
/// 1. Config file (config.json) if it exists, otherwise defaults
/// 2. Environment variable overrides (includes .env)
pub fn load_config() -> Result<Config> {
    let config_path = super::paths::config_path();

    let mut config = if config_path.exists() {
        load_config_from_path(&config_path)?
    } else {
        Config::default()
    };

    // Load .env file if it exists
    dotenvy::dotenv().ok();
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    // Detect format by extension
    let config: Config = if path.extension().is_some_and(|ext| ext == "json" || ext == "json5") {
        json5::from_str(&content).map_err(|e| Error::Config(format!("Invalid JSON config: {}", e)))?
    } else if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&content).map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))?
    } else {
        // Try JSON5 first, then TOML
        json5::from_str(&content)
            .or_else(|_| toml::from_str(&content).map_err(|e| Error::Config(e.to_string())))
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?
    };

    Ok(config)
}

fn is_blank(secret: &Option<SecretString>) -> bool {
    secret
        .as_ref()
        .map_or(true, |s| s.expose_secret().trim().is_empty())
}

/// Overlay environment variables onto an existing config.
///
/// Credentials from the environment only fill fields the file left empty,
/// so the security validator never needs to look at the environment itself.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(token) = lookup("OPENGATE_GATEWAY_TOKEN") {
        if is_blank(&config.gateway.auth.token) {
            config.gateway.auth.token = Some(SecretString::from(token));
        }
    }
    if let Some(password) = lookup("OPENGATE_GATEWAY_PASSWORD") {
        if is_blank(&config.gateway.auth.password) {
            config.gateway.auth.password = Some(SecretString::from(password));
        }
    }
    if let Some(port) = lookup("OPENGATE_GATEWAY_PORT") {
        match port.trim().parse() {
            Ok(port) => config.gateway.port = port,
            Err(_) => tracing::warn!(value = %port, "ignoring invalid OPENGATE_GATEWAY_PORT"),
        }
    }
    if let Some(dir) = lookup("OPENGATE_STATE_DIR") {
        config.state_dir = Some(std::path::PathBuf::from(dir));
    }
}

/// Save configuration to a file (credentials are never written)
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    let content = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::to_string_pretty(config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    } else {
        serde_json::to_string_pretty(config)?
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, content)?;
    Ok(())
}
