//! Session store configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Session store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsConfig {
    /// Root directory for per-agent session folders (default `<stateDir>/agents`)
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Agent used when a request names none
    #[serde(default = "default_agent")]
    pub default_agent: String,
    /// Archive listing only counts messages in files up to this size
    #[serde(default = "default_message_count_max_bytes")]
    pub message_count_max_bytes: u64,
    /// Unreferenced transcripts modified more recently than this are not yet reported as orphaned
    #[serde(default, with = "humantime_serde")]
    pub orphan_grace: Duration,
    /// Drop registry entries not updated for this long
    #[serde(default = "default_prune_after", with = "humantime_serde")]
    pub prune_after: Duration,
    /// Keep at most this many registry entries (most recently updated win)
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Rotate the registry file to `.bak.<ms>` once it grows past this size
    #[serde(default = "default_rotate_bytes")]
    pub rotate_bytes: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        SessionsConfig {
            dir: None,
            default_agent: default_agent(),
            message_count_max_bytes: default_message_count_max_bytes(),
            orphan_grace: Duration::ZERO,
            prune_after: default_prune_after(),
            max_entries: default_max_entries(),
            rotate_bytes: default_rotate_bytes(),
        }
    }
}

fn default_agent() -> String {
    "main".to_string()
}

fn default_message_count_max_bytes() -> u64 {
    2 * 1024 * 1024
}

fn default_prune_after() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

fn default_max_entries() -> usize {
    500
}

fn default_rotate_bytes() -> u64 {
    10 * 1024 * 1024
}
