//! Connection authentication
//!
//! Validates the credentials of a `connect` request according to the
//! configured mode:
//!
//! - `token`: shared token, compared in constant time
//! - `password`: shared password, compared in constant time
//! - `trusted-proxy`: identity asserted by an operator-controlled proxy
//!   through a request header
//!
//! Repeated failures from one remote identity are throttled by
//! [`AuthRateLimiter`]; a locked-out identity is rejected before its
//! credentials are examined.

pub mod rate_limit;

pub use rate_limit::AuthRateLimiter;

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

use super::protocol::ConnectAuth;
use crate::config::{AuthConfig, AuthMode, TrustedProxyConfig};
use crate::error::{Error, Result};

/// Everything the authenticator looks at for one connection
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    /// Peer address of the socket
    pub remote: SocketAddr,
    /// HTTP upgrade request headers
    pub headers: &'a HeaderMap,
    /// Credentials from `connect`
    pub auth: Option<&'a ConnectAuth>,
}

/// Successful authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    /// Mode that accepted the connection
    pub mode: AuthMode,
    /// User asserted by a trusted proxy
    pub user: Option<String>,
}

/// Credential checker with failure throttling
#[derive(Debug)]
pub struct Authenticator {
    config: AuthConfig,
    limiter: AuthRateLimiter,
}

impl Authenticator {
    /// Create an authenticator from config
    pub fn new(config: AuthConfig) -> Self {
        let limiter = AuthRateLimiter::new(config.rate_limit.clone());
        Authenticator { config, limiter }
    }

    /// Configured mode
    pub fn mode(&self) -> Option<AuthMode> {
        self.config.mode
    }

    /// The failure limiter
    pub fn limiter(&self) -> &AuthRateLimiter {
        &self.limiter
    }

    /// Check a connection's credentials
    ///
    /// Fails with [`Error::RateLimit`] while the peer is locked out (the
    /// credential check is skipped entirely) and with [`Error::AuthFailed`]
    /// on bad credentials.
    pub fn check_access(&self, request: &AuthRequest<'_>) -> Result<AuthOutcome> {
        let identity = self.limiter_identity(request);

        if let Some(identity) = identity.as_deref() {
            if let Err(retry_after) = self.limiter.check(identity) {
                tracing::debug!(remote = %request.remote, identity = %identity, "auth attempt rejected by rate limiter");
                return Err(Error::RateLimit { retry_after });
            }
        }

        match self.verify(request) {
            Ok(outcome) => {
                if let Some(identity) = identity.as_deref() {
                    self.limiter.record_success(identity);
                }
                Ok(outcome)
            }
            Err(e) => {
                tracing::info!(remote = %request.remote, error = %e, "authentication failed");
                if let Some(identity) = identity.as_deref() {
                    self.limiter.record_failure(identity);
                }
                // The reason stays in the log; clients learn only that they were refused
                Err(match e {
                    Error::AuthFailed(_) => Error::AuthFailed(CLIENT_AUTH_FAILURE.into()),
                    other => other,
                })
            }
        }
    }

    /// Key the failure limiter counts against
    ///
    /// Behind a trusted proxy every request shares the proxy's address, so
    /// the asserted user is the key. Headers from anywhere else are not
    /// trusted and the peer address is used.
    fn limiter_identity(&self, request: &AuthRequest<'_>) -> Option<String> {
        let ip = request.remote.ip();
        let peer = self.limiter.identity_for(ip)?;

        if self.config.mode == Some(AuthMode::TrustedProxy) {
            let user = self
                .config
                .trusted_proxy
                .as_ref()
                .filter(|proxy| is_trusted_proxy(proxy, ip))
                .and_then(|proxy| header_value(request.headers, &proxy.user_header));
            if let Some(user) = user {
                return Some(format!("user:{}", user));
            }
        }
        Some(peer)
    }

    fn verify(&self, request: &AuthRequest<'_>) -> Result<AuthOutcome> {
        let mode = self
            .config
            .mode
            .ok_or_else(|| Error::AuthFailed("gateway authentication is not configured".into()))?;

        match mode {
            AuthMode::Token => {
                let provided = request.auth.and_then(|a| a.token.as_deref());
                verify_secret(self.config.token.as_ref(), provided, "token")?;
                Ok(AuthOutcome { mode, user: None })
            }
            AuthMode::Password => {
                let provided = request.auth.and_then(|a| a.password.as_deref());
                verify_secret(self.config.password.as_ref(), provided, "password")?;
                Ok(AuthOutcome { mode, user: None })
            }
            AuthMode::TrustedProxy => {
                let proxy = self.config.trusted_proxy.as_ref().ok_or_else(|| {
                    Error::AuthFailed("trusted proxy is not configured".into())
                })?;
                let user = verify_trusted_proxy(proxy, request)?;
                Ok(AuthOutcome {
                    mode,
                    user: Some(user),
                })
            }
        }
    }
}

/// Detail sent to clients for every credential failure
const CLIENT_AUTH_FAILURE: &str = "invalid credentials";

/// Constant-time string equality
pub fn secrets_match(expected: &str, provided: &str) -> bool {
    bool::from(expected.as_bytes().ct_eq(provided.as_bytes()))
}

fn verify_secret(expected: Option<&SecretString>, provided: Option<&str>, what: &str) -> Result<()> {
    let expected = expected
        .map(|s| s.expose_secret())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::AuthFailed(format!("gateway {} is not configured", what)))?;
    let provided = provided.ok_or_else(|| Error::AuthFailed(format!("{} missing", what)))?;

    if secrets_match(expected, provided) {
        Ok(())
    } else {
        Err(Error::AuthFailed(format!("{} mismatch", what)))
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn is_trusted_proxy(proxy: &TrustedProxyConfig, ip: IpAddr) -> bool {
    if proxy.trusted_proxies.is_empty() {
        ip.is_loopback()
    } else {
        proxy.trusted_proxies.contains(&ip)
    }
}

fn verify_trusted_proxy(proxy: &TrustedProxyConfig, request: &AuthRequest<'_>) -> Result<String> {
    let ip = request.remote.ip();
    if !is_trusted_proxy(proxy, ip) {
        return Err(Error::AuthFailed(format!(
            "request from {} did not come through a trusted proxy",
            ip
        )));
    }

    if let Some(missing) = proxy
        .required_headers
        .iter()
        .find(|h| header_value(request.headers, h).is_none())
    {
        return Err(Error::AuthFailed(format!("missing required header {}", missing)));
    }

    let user = header_value(request.headers, &proxy.user_header)
        .ok_or_else(|| Error::AuthFailed(format!("missing user header {}", proxy.user_header)))?;

    if !proxy.allow_users.is_empty() && !proxy.allow_users.iter().any(|u| u == user) {
        return Err(Error::AuthFailed(format!("user {} is not allowed", user)));
    }

    Ok(user.to_string())
}
