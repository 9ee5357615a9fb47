//! Gateway protocol types
//!
//! Request/response types for gateway methods.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ============================================================================
// Handshake
// ============================================================================

/// Connection role
///
/// Ordered by privilege: an operator may call anything a node may call.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Read-only observer
    Viewer,
    /// Headless node / tool host
    Node,
    /// Full control-plane access
    #[default]
    Operator,
}

impl Role {
    /// Wire spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Node => "node",
            Role::Operator => "operator",
        }
    }

    /// Whether this role satisfies `required`
    pub fn allows(&self, required: Role) -> bool {
        *self >= required
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            "node" => Ok(Role::Node),
            "operator" => Ok(Role::Operator),
            other => Err(crate::Error::InvalidInput(format!("unknown role: {}", other))),
        }
    }
}

/// Client self-description sent in `connect`
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Client identifier, e.g. `cli` or `webchat`
    pub id: String,
    /// Client version
    #[serde(default)]
    pub version: String,
    /// Platform, e.g. `linux`
    #[serde(default)]
    pub platform: String,
    /// Client mode, e.g. `cli`, `ui`, `node`
    #[serde(default)]
    pub mode: String,
    /// Per-process instance id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// Shared-secret credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    /// Token (for token auth)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Password (for password auth)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Device identity presented at connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceParams {
    /// Stable device id
    pub id: String,
    /// Device public key
    pub public_key: String,
}

/// Parameters of the `connect` request
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    /// Lowest protocol version the client accepts
    pub min_protocol: u32,
    /// Highest protocol version the client accepts
    pub max_protocol: u32,
    /// Client description
    pub client: ClientInfo,
    /// Client capabilities
    #[serde(default)]
    pub caps: Vec<String>,
    /// Requested role
    #[serde(default)]
    pub role: Role,
    /// Credentials
    #[serde(default)]
    pub auth: Option<ConnectAuth>,
    /// Device identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceParams>,
}

/// Server identity in the handshake response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Gateway version
    pub version: String,
    /// Connection id assigned to this socket
    pub conn_id: String,
}

/// Result of a successful `connect`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    /// Negotiated protocol version
    pub protocol: u32,
    /// Capabilities granted for this connection
    pub capabilities: Vec<String>,
    /// Granted role
    pub role: Role,
    /// Server identity
    pub server: ServerInfo,
    /// Maximum accepted frame size in bytes
    pub max_payload: usize,
}

// ============================================================================
// Device pairing
// ============================================================================

/// A device waiting for operator approval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    /// Request id
    pub request_id: String,
    /// Device id
    pub device_id: String,
    /// Device public key
    pub public_key: String,
    /// Requested role
    pub role: Role,
    /// The device was paired before and failed verification
    #[serde(default)]
    pub is_repair: bool,
    /// Creation time (ms since epoch)
    pub ts: i64,
    /// Client id from the handshake
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Platform from the handshake
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Remote address the request arrived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
}

/// An approved device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedDevice {
    /// Device id
    pub device_id: String,
    /// Device public key
    pub public_key: String,
    /// Approved role
    pub role: Role,
    /// Approval time (ms since epoch)
    pub approved_at: i64,
    /// Operator note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Client id at approval time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Platform at approval time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

/// Result of `device.pair.list`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePairingList {
    /// Pending requests, newest first
    pub pending: Vec<PairingRequest>,
    /// Paired devices
    pub paired: Vec<PairedDevice>,
}

/// Parameters of `device.pair.list`
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PairListParams {}

/// Parameters of `device.pair.approve`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ApprovePairingParams {
    /// Request to approve
    pub request_id: String,
    /// Operator note
    #[serde(default)]
    pub note: Option<String>,
}

/// Parameters of `device.pair.reject`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RejectPairingParams {
    /// Request to reject
    pub request_id: String,
}

/// Parameters of `device.pair.remove`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RemoveDeviceParams {
    /// Device to forget
    pub device_id: String,
}

/// Result of `device.pair.approve`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovedDevice {
    /// Consumed request id
    pub request_id: String,
    /// The new paired record
    pub device: PairedDevice,
}

// ============================================================================
// Sessions
// ============================================================================

/// Why a transcript is no longer the active session file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveReason {
    /// Rotated away by a session reset
    Reset,
    /// Session deleted
    Deleted,
    /// Backup copy
    Bak,
    /// Plain transcript no longer referenced by the registry
    Orphaned,
}

impl ArchiveReason {
    /// Wire spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveReason::Reset => "reset",
            ArchiveReason::Deleted => "deleted",
            ArchiveReason::Bak => "bak",
            ArchiveReason::Orphaned => "orphaned",
        }
    }
}

/// One archived transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionArchiveEntry {
    /// Session id recovered from the transcript header
    pub session_id: String,
    /// File name inside the sessions directory
    pub file_name: String,
    /// Archive classification
    pub archive_reason: ArchiveReason,
    /// When the transcript was archived (ms since epoch)
    pub archived_at: i64,
    /// When the session was created (ms since epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    /// File size
    pub size_bytes: u64,
    /// Message count; absent when the file was too large to scan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<u64>,
}

/// Parameters of `sessions.archives`
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ArchivesListParams {
    /// Agent whose sessions to scan (default agent when absent)
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Page size, 1..=200
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Result of `sessions.archives`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivesListResult {
    /// Requested page, newest first
    pub archives: Vec<SessionArchiveEntry>,
    /// Number of archived transcripts before paging
    pub total: usize,
}

/// Parameters shared by key-addressed session methods
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionKeyParams {
    /// Session key
    pub key: String,
    /// Agent id
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// Parameters of `sessions.list`
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionsListParams {
    /// Agent id
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Maximum results
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Parameters of `sessions.history`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionHistoryParams {
    /// Session key
    pub key: String,
    /// Agent id
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Messages per streamed batch
    #[serde(default)]
    pub batch_size: Option<u32>,
}

/// Parameters of `sessions.append`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionAppendParams {
    /// Session key
    pub key: String,
    /// Agent id
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Message to append (role/content object)
    pub message: serde_json::Value,
    /// Deduplication key
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_params_defaults() {
        let params: ConnectParams = serde_json::from_value(serde_json::json!({
            "minProtocol": 1,
            "maxProtocol": 3,
            "client": {"id": "cli", "version": "0.1.0", "platform": "linux", "mode": "cli"}
        }))
        .unwrap();

        assert_eq!(params.role, Role::Operator);
        assert!(params.auth.is_none());
        assert!(params.caps.is_empty());
    }

    #[test]
    fn test_role_ordering() {
        assert!(Role::Operator.allows(Role::Node));
        assert!(!Role::Viewer.allows(Role::Operator));
        assert_eq!("Operator".parse::<Role>().unwrap(), Role::Operator);
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn test_archive_params_reject_unknown_fields() {
        let result = serde_json::from_value::<ArchivesListParams>(serde_json::json!({"limt": 5}));
        assert!(result.is_err());
    }
}
