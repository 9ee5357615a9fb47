//! Session transcripts
//!
//! Each agent owns a directory `<agentsDir>/<agentId>/sessions/` holding:
//!
//! - `sessions.json`: the registry mapping a session key to its active
//!   transcript
//! - `<sessionId>.jsonl`: transcripts, one JSON object per line, starting
//!   with a `{"type":"session", ...}` header
//! - archived transcripts, renamed with a `.reset.<ts>`, `.deleted.<ts>` or
//!   `.bak.<ts>` suffix
//!
//! [`SessionStore`] is the only writer. Archive listing only reads.

pub mod archive;
pub mod store;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use archive::{
    clamp_limit, classify_file, format_archive_timestamp, list_archives, parse_archive_timestamp,
    ArchiveListOptions, FileClass, DEFAULT_ARCHIVE_LIMIT, MAX_ARCHIVE_LIMIT,
};
pub use store::{
    cap_entry_count, prune_stale_entries, rotate_registry_file, SessionReset, SessionStore, SessionSummary,
    MAX_REGISTRY_BACKUPS,
};

/// Registry file name inside a sessions directory
pub const REGISTRY_FILE: &str = "sessions.json";

/// Transcript file extension
pub const TRANSCRIPT_EXT: &str = "jsonl";

/// Active-session registry: session key to entry
pub type SessionRegistry = BTreeMap<String, SessionEntry>;

/// Registry record for one session key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    /// Id of the active transcript
    pub session_id: String,
    /// Last write (ms since epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    /// Transcript file (name or path), when it differs from `<sessionId>.jsonl`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_file: Option<String>,
    /// Display label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl SessionEntry {
    /// File name of the active transcript
    ///
    /// `sessionFile` may hold a full path; only its last component is used,
    /// so registry values never address files outside the sessions directory.
    pub fn transcript_file_name(&self) -> String {
        self.session_file
            .as_deref()
            .and_then(|file| Path::new(file).file_name())
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.{}", self.session_id, TRANSCRIPT_EXT))
    }
}
