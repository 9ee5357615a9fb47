//! Handshake negotiation and connection bookkeeping
//!
//! Every socket walks the same state machine:
//!
//! ```text
//! Connecting ──open──▶ Handshaking ──auth ok──▶ Authenticated
//!      │                    │                        │
//!      └────────────────────┴─────── close ──────────┴──▶ Closing ──▶ Closed
//! ```
//!
//! Frames are admitted according to the current state, never according to
//! the order in which socket callbacks happen to fire.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use super::protocol::{ClientInfo, ConnectParams, Role, CONNECT_METHOD, SUPPORTED_PROTOCOLS};
use crate::error::{Error, Result};

/// Pick the highest supported version inside `[min, max]`
///
/// Returns `None` when the ranges do not intersect (including `min > max`).
pub fn negotiate_protocol(min: u32, max: u32) -> Option<u32> {
    negotiate_protocol_with(SUPPORTED_PROTOCOLS, min, max)
}

/// Same as [`negotiate_protocol`] against an explicit supported set
pub fn negotiate_protocol_with(supported: &[u32], min: u32, max: u32) -> Option<u32> {
    supported
        .iter()
        .copied()
        .filter(|v| (min..=max).contains(v))
        .max()
}

/// Details for a protocol-mismatch rejection
pub fn protocol_mismatch_details(params: &ConnectParams) -> serde_json::Value {
    serde_json::json!({
        "minProtocol": params.min_protocol,
        "maxProtocol": params.max_protocol,
        "supported": SUPPORTED_PROTOCOLS,
    })
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    /// Socket accepted, upgrade not finished
    Connecting,
    /// Waiting for the `connect` request
    Handshaking,
    /// Handshake and auth done; RPCs accepted
    Authenticated,
    /// Close initiated; no new work accepted
    Closing,
    /// Gone
    Closed,
}

/// What to do with an inbound request in the current state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Run the handshake
    Handshake,
    /// Hand to the dispatcher
    Dispatch,
    /// Reject with a reason; `close` means the connection must be closed
    Reject {
        /// Client-facing reason
        reason: String,
        /// Whether the violation ends the connection
        close: bool,
    },
}

impl ConnState {
    /// Socket upgrade complete
    pub fn on_open(self) -> Result<Self> {
        match self {
            ConnState::Connecting => Ok(ConnState::Handshaking),
            other => Err(invalid_transition(other, "open")),
        }
    }

    /// Handshake and authentication succeeded
    pub fn on_authenticated(self) -> Result<Self> {
        match self {
            ConnState::Handshaking => Ok(ConnState::Authenticated),
            other => Err(invalid_transition(other, "authenticate")),
        }
    }

    /// Close initiated by either side
    pub fn on_close(self) -> Self {
        match self {
            ConnState::Closed => ConnState::Closed,
            _ => ConnState::Closing,
        }
    }

    /// Socket fully torn down
    pub fn on_closed(self) -> Self {
        ConnState::Closed
    }

    /// Whether RPCs may be dispatched
    pub fn is_authenticated(&self) -> bool {
        matches!(self, ConnState::Authenticated)
    }

    /// Decide how to treat a request for `method`
    pub fn admit(&self, method: &str) -> Admission {
        match (self, method == CONNECT_METHOD) {
            (ConnState::Handshaking, true) => Admission::Handshake,
            (ConnState::Handshaking, false) => Admission::Reject {
                reason: format!("first request must be `{}`, got `{}`", CONNECT_METHOD, method),
                close: true,
            },
            (ConnState::Authenticated, true) => Admission::Reject {
                reason: "connection already established".to_string(),
                close: false,
            },
            (ConnState::Authenticated, false) => Admission::Dispatch,
            (ConnState::Connecting, _) | (ConnState::Closing, _) | (ConnState::Closed, _) => {
                Admission::Reject {
                    reason: "connection is not accepting requests".to_string(),
                    close: false,
                }
            }
        }
    }
}

fn invalid_transition(state: ConnState, event: &str) -> Error {
    Error::Protocol(format!("cannot {} from {:?} state", event, state))
}

/// Introspection record for one live connection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Server-assigned connection id
    pub conn_id: String,
    /// Peer address
    pub remote: SocketAddr,
    /// Negotiated protocol version
    pub protocol: u32,
    /// Granted role
    pub role: Role,
    /// Client description from `connect`
    pub client: ClientInfo,
    /// Client capabilities
    pub caps: Vec<String>,
    /// Authenticated user (trusted-proxy mode)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Device id presented at connect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Connect time (ms since epoch)
    pub connected_at: i64,
}

/// Live connections, keyed by connection id
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<String, ConnectionInfo>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an authenticated connection
    pub async fn register(&self, info: ConnectionInfo) {
        self.inner.write().await.insert(info.conn_id.clone(), info);
    }

    /// Forget a connection; returns the removed record
    pub async fn unregister(&self, conn_id: &str) -> Option<ConnectionInfo> {
        self.inner.write().await.remove(conn_id)
    }

    /// Look up one connection
    pub async fn get(&self, conn_id: &str) -> Option<ConnectionInfo> {
        self.inner.read().await.get(conn_id).cloned()
    }

    /// Snapshot of every connection, oldest first
    pub async fn list(&self) -> Vec<ConnectionInfo> {
        let mut conns: Vec<ConnectionInfo> = self.inner.read().await.values().cloned().collect();
        conns.sort_by_key(|c| c.connected_at);
        conns
    }

    /// Number of live connections
    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }
}
