//! Configuration paths
//!
//! Utilities for resolving configuration file paths.

use std::path::{Path, PathBuf};

/// Get the configuration directory
pub fn config_dir() -> PathBuf {
    // Check for explicit override
    if let Ok(dir) = std::env::var("OPENGATE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    // Use XDG config directory or fallback
    dirs::config_dir()
        .map(|d| d.join("opengate"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".config").join("opengate"))
                .unwrap_or_else(|| PathBuf::from(".opengate"))
        })
}

/// Get the main configuration file path
pub fn config_path() -> PathBuf {
    // Check for explicit override
    if let Ok(path) = std::env::var("OPENGATE_CONFIG") {
        return PathBuf::from(path);
    }

    config_dir().join("config.json")
}

/// Get the state directory (pairing tables, session transcripts)
pub fn state_dir() -> PathBuf {
    // Check for explicit override
    if let Ok(dir) = std::env::var("OPENGATE_STATE_DIR") {
        return PathBuf::from(dir);
    }

    // Use XDG data directory or fallback
    dirs::data_dir()
        .map(|d| d.join("opengate"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".local").join("share").join("opengate"))
                .unwrap_or_else(|| PathBuf::from(".opengate"))
        })
}

/// Directory holding the pending/paired device tables
pub fn devices_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("devices")
}

/// Root of the per-agent session folders
pub fn agents_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("agents")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths() {
        // Just ensure these don't panic
        let _ = config_dir();
        let _ = config_path();
        let _ = state_dir();
    }

    #[test]
    fn test_state_subdirs() {
        let root = Path::new("/var/lib/opengate");
        assert_eq!(devices_dir(root), PathBuf::from("/var/lib/opengate/devices"));
        assert_eq!(agents_dir(root), PathBuf::from("/var/lib/opengate/agents"));
    }
}
