//! Configuration types module
//!
//! The resolved configuration object the gateway core consumes.

pub mod sessions;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Session store configuration
    #[serde(default)]
    pub sessions: sessions::SessionsConfig,

    /// State directory override (pairing tables, session transcripts)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables and files
    ///
    /// It loads configuration from:
    /// 1. Default values
    /// 2. Config file (if present)
    /// 3. Environment variable overrides
    pub fn from_env() -> crate::error::Result<Self> {
        crate::config::load_config()
    }

    /// Effective state directory
    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(crate::config::state_dir)
    }
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,
    /// Explicit opt-in that authentication was configured on purpose
    #[serde(default)]
    pub security_configured: Option<bool>,
    /// Time allowed between socket open and the `connect` request
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// How long a completed idempotent request is replayed
    #[serde(default = "default_idempotency_ttl", with = "humantime_serde")]
    pub idempotency_ttl: Duration,
    /// Upper bound on remembered idempotency keys
    #[serde(default = "default_idempotency_capacity")]
    pub idempotency_capacity: u64,
    /// Maximum accepted frame size in bytes
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            port: default_port(),
            bind: default_bind(),
            auth: AuthConfig::default(),
            security_configured: None,
            handshake_timeout: default_handshake_timeout(),
            idempotency_ttl: default_idempotency_ttl(),
            idempotency_capacity: default_idempotency_capacity(),
            max_payload_bytes: default_max_payload(),
        }
    }
}

fn default_port() -> u16 {
    18789
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_idempotency_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_idempotency_capacity() -> u64 {
    10_000
}

fn default_max_payload() -> usize {
    512 * 1024
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// Authentication mode; unset means "not configured"
    #[serde(default)]
    pub mode: Option<AuthMode>,
    /// Shared token (for token mode)
    #[serde(skip_serializing, default)]
    pub token: Option<SecretString>,
    /// Shared password (for password mode)
    #[serde(skip_serializing, default)]
    pub password: Option<SecretString>,
    /// Identity-aware proxy settings (for trusted-proxy mode)
    #[serde(default)]
    pub trusted_proxy: Option<TrustedProxyConfig>,
    /// Failed-auth throttling
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// Authentication mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// Shared token compare
    Token,
    /// Shared password compare
    Password,
    /// Identity delegated to an operator-controlled proxy header
    TrustedProxy,
}

impl AuthMode {
    /// Config spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Token => "token",
            AuthMode::Password => "password",
            AuthMode::TrustedProxy => "trusted-proxy",
        }
    }
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trusted-proxy settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedProxyConfig {
    /// Header carrying the authenticated user
    #[serde(default)]
    pub user_header: String,
    /// Headers that must be present on every request
    #[serde(default)]
    pub required_headers: Vec<String>,
    /// Allowed users (empty = any user the proxy vouches for)
    #[serde(default)]
    pub allow_users: Vec<String>,
    /// Proxy addresses allowed to assert identity (empty = loopback only)
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

/// Failed-auth throttling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Failures allowed inside the window before lockout
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Sliding window length
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,
    /// First lockout duration
    #[serde(default = "default_lockout", with = "humantime_serde")]
    pub lockout: Duration,
    /// Lockout cap
    #[serde(default = "default_max_lockout", with = "humantime_serde")]
    pub max_lockout: Duration,
    /// Exempt loopback clients from throttling
    #[serde(default)]
    pub exempt_loopback: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            max_attempts: default_max_attempts(),
            window: default_window(),
            lockout: default_lockout(),
            max_lockout: default_max_lockout(),
            exempt_loopback: false,
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_lockout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_lockout() -> Duration {
    Duration::from_secs(15 * 60)
}
