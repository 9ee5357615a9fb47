//! Configuration module - Modular configuration management
//!
//! The gateway core consumes one resolved [`Config`]; this module builds it:
//! - types/mod.rs: Core configuration types (Config, GatewayConfig, AuthConfig)
//! - types/sessions.rs: Session store configuration
//! - io.rs: Configuration loading and saving
//! - paths.rs: Configuration file paths
//! - security.rs: Fail-closed startup security requirements

mod io;
mod paths;
mod security;
mod types;

// Re-export core config types
pub use types::{AuthConfig, AuthMode, Config, GatewayConfig, RateLimitConfig, TrustedProxyConfig};

// Re-export session types
pub use types::sessions::SessionsConfig;

// Re-export IO and utilities
pub use io::{apply_env_overrides, load_config, load_config_from_path, save_config};
pub use paths::{agents_dir, config_dir, config_path, devices_dir, state_dir};
pub use security::{
    ensure_security_requirements, format_security_failures, validate_security_requirements,
    SecurityRequirement, SecurityValidationResult, MANDATORY_SECURITY_REQUIREMENTS,
};
