//! Gateway protocol schema
//!
//! Defines the wire format for gateway messages.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Highest protocol version this gateway speaks
pub const PROTOCOL_VERSION: u32 = 3;

/// Every protocol version this gateway can negotiate, ascending
pub const SUPPORTED_PROTOCOLS: &[u32] = &[1, 2, 3];

/// Method name of the handshake request
pub const CONNECT_METHOD: &str = "connect";

/// Gateway frame - Top-level message envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    /// Request from client
    #[serde(rename = "req")]
    Request(RequestFrame),
    /// Response from server
    #[serde(rename = "res")]
    Response(ResponseFrame),
    /// Event pushed by server
    #[serde(rename = "event")]
    Event(EventFrame),
}

/// Request frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    /// Unique request ID
    pub id: String,
    /// Method name
    pub method: String,
    /// Parameters
    #[serde(default)]
    pub params: serde_json::Value,
    /// Deduplication key for retried mutating requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl RequestFrame {
    /// Create a request frame
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: serde_json::Value) -> Self {
        RequestFrame {
            id: id.into(),
            method: method.into(),
            params,
            idempotency_key: None,
        }
    }

    /// Attach an idempotency key
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Idempotency key from the frame, falling back to `params.idempotencyKey`
    pub fn resolved_idempotency_key(&self) -> Option<&str> {
        self.idempotency_key
            .as_deref()
            .or_else(|| self.params.get("idempotencyKey").and_then(|v| v.as_str()))
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

fn default_final() -> bool {
    true
}

fn is_final(value: &bool) -> bool {
    *value
}

/// Response frame
///
/// A request id may receive any number of intermediate responses
/// (`final: false`) followed by exactly one terminal response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    /// Request ID this responds to
    pub id: String,
    /// Whether the request succeeded
    pub ok: bool,
    /// Result (success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error (failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
    /// False for intermediate (streamed) messages
    #[serde(rename = "final", default = "default_final", skip_serializing_if = "is_final")]
    pub is_final: bool,
}

impl ResponseFrame {
    /// Create a success response
    pub fn success(id: impl Into<String>, result: serde_json::Value) -> Self {
        ResponseFrame {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
            is_final: true,
        }
    }

    /// Create an intermediate (non-terminal) response
    pub fn intermediate(id: impl Into<String>, result: serde_json::Value) -> Self {
        ResponseFrame {
            is_final: false,
            ..Self::success(id, result)
        }
    }

    /// Create an error response
    pub fn error(id: impl Into<String>, error: ErrorShape) -> Self {
        ResponseFrame {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(error),
            is_final: true,
        }
    }
}

/// Event frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    /// Event name
    pub event: String,
    /// Event data
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Timestamp (ms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

impl EventFrame {
    /// Create a new event
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        EventFrame {
            event: event.into(),
            payload,
            ts: Some(chrono::Utc::now().timestamp_millis()),
        }
    }
}

/// Error codes returned to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed request or params; never auto-retried
    InvalidRequest,
    /// Credentials rejected or role insufficient
    Unauthorized,
    /// Too many failures; back off for the indicated cooldown
    RateLimited,
    /// Device must be paired (or re-paired) first
    PairingRequired,
    /// Unknown method or resource
    NotFound,
    /// Transient failure, safe to retry
    Unavailable,
    /// Bug; details stay server-side
    Internal,
}

impl ErrorCode {
    /// Wire spelling of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::PairingRequired => "PAIRING_REQUIRED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-facing error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    /// Error code
    pub code: ErrorCode,
    /// Error message
    pub message: String,
    /// Whether the client may retry as-is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    /// Cooldown before the next attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Additional data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorShape {
    /// Create a new error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ErrorShape {
            code,
            message: message.into(),
            retryable: None,
            retry_after_ms: None,
            details: None,
        }
    }

    /// Add data to the error
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Mark the error as safe to retry
    pub fn retryable(mut self) -> Self {
        self.retryable = Some(true);
        self
    }

    /// Attach a cooldown
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self.retryable = Some(true);
        self
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// Create a method not found error
    pub fn method_not_found(method: &str) -> Self {
        Self::new(ErrorCode::NotFound, format!("unknown method: {}", method))
    }

    /// Create an internal error
    pub fn internal() -> Self {
        Self::new(ErrorCode::Internal, "internal error")
    }
}

/// WebSocket close codes used by the gateway
pub mod close_codes {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Policy violation (auth failure, pairing required)
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Frame exceeded the payload limit
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    /// Server failed while setting up the connection
    pub const INTERNAL_ERROR: u16 = 1011;
    /// No `connect` request arrived within the handshake timeout
    pub const HANDSHAKE_TIMEOUT: u16 = 4000;
    /// First frame was not a valid `connect` request
    pub const INVALID_HANDSHAKE: u16 = 4001;
    /// No protocol version in common
    pub const PROTOCOL_MISMATCH: u16 = 4002;
    /// Gateway shutting down
    pub const GOING_AWAY: u16 = 1001;
}

/// Close reason substring that marks a pairing failure; the repair flow keys on it
pub const PAIRING_REQUIRED_REASON: &str = "pairing required";
