//! Error types for OpenGate

use std::time::Duration;

use thiserror::Error;

use crate::gateway::protocol::{ErrorCode, ErrorShape};

/// Result type alias using OpenGate's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for OpenGate
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Startup refused by the security requirement check
    #[error("{0}")]
    SecurityValidation(String),

    /// Malformed frame or handshake violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller lacks the role for the operation
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Credential check failed
    #[error("unauthorized: {0}")]
    AuthFailed(String),

    /// Device must be (re)paired before it may connect
    #[error("pairing required: {0}")]
    PairingRequired(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded, retry after {}ms", retry_after.as_millis())]
    RateLimit {
        /// Remaining cooldown
        retry_after: Duration,
    },

    /// Dependency temporarily unavailable
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::WebSocket(_) | Error::RateLimit { .. } | Error::Unavailable(_) | Error::Timeout(_)
        )
    }

    /// Check if error is a client error (user's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidInput(_)
                | Error::Protocol(_)
                | Error::NotFound(_)
                | Error::Unauthorized(_)
                | Error::AuthFailed(_)
                | Error::PairingRequired(_)
        )
    }

    /// Wire error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidInput(_) | Error::Protocol(_) => ErrorCode::InvalidRequest,
            Error::Unauthorized(_) | Error::AuthFailed(_) => ErrorCode::Unauthorized,
            Error::PairingRequired(_) => ErrorCode::PairingRequired,
            Error::RateLimit { .. } => ErrorCode::RateLimited,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::Unavailable(_) | Error::Timeout(_) => ErrorCode::Unavailable,
            Error::Config(_)
            | Error::SecurityValidation(_)
            | Error::WebSocket(_)
            | Error::Json(_)
            | Error::Io(_)
            | Error::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Client-facing `{code, message}`.
    ///
    /// Internal failures are reported generically; the caller is expected to
    /// have logged the full error.
    pub fn to_shape(&self) -> ErrorShape {
        let code = self.code();
        let shape = match code {
            ErrorCode::Internal => ErrorShape::new(code, "internal error"),
            _ => ErrorShape::new(code, self.to_string()),
        };
        match self {
            Error::RateLimit { retry_after } => {
                shape.with_retry_after(*retry_after)
            }
            Error::Unavailable(_) | Error::Timeout(_) => shape.retryable(),
            _ => shape,
        }
    }
}

impl From<json5::Error> for Error {
    fn from(err: json5::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(format!("background task failed: {}", err))
    }
}
