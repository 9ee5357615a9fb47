//! Session registry and transcript store

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::archive::{self, clamp_limit, format_archive_timestamp, ArchiveListOptions};
use super::{SessionEntry, SessionRegistry, REGISTRY_FILE};
use crate::config::{agents_dir, Config, SessionsConfig};
use crate::error::{Error, Result};
use crate::gateway::protocol::ArchivesListResult;
use crate::persist::{read_json_or_default, write_json_atomic};

/// Registry backups kept by [`rotate_registry_file`]
pub const MAX_REGISTRY_BACKUPS: usize = 3;

/// Listing row for `sessions.list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session key
    pub key: String,
    /// Active transcript id
    pub session_id: String,
    /// Last write (ms since epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    /// Display label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Outcome of [`SessionStore::reset_session`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReset {
    /// Fresh registry entry
    pub entry: SessionEntry,
    /// File name the previous transcript was archived under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<String>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Drop entries whose `updatedAt` is older than `max_age`
///
/// Entries without `updatedAt` are kept. Returns the number removed.
pub fn prune_stale_entries(registry: &mut SessionRegistry, max_age: Duration, now_ms: i64) -> usize {
    let cutoff = now_ms.saturating_sub(max_age.as_millis() as i64);
    let before = registry.len();
    registry.retain(|_, entry| entry.updated_at.map_or(true, |at| at >= cutoff));
    before - registry.len()
}

/// Keep the `max` most recently updated entries
///
/// Entries without `updatedAt` are evicted first. Returns the number removed.
pub fn cap_entry_count(registry: &mut SessionRegistry, max: usize) -> usize {
    if registry.len() <= max {
        return 0;
    }
    let mut keys: Vec<(Option<i64>, String)> = registry
        .iter()
        .map(|(key, entry)| (entry.updated_at, key.clone()))
        .collect();
    // None sorts lowest, so newest-first puts undated entries last
    keys.sort_by(|a, b| b.0.cmp(&a.0));

    let evicted = keys.len() - max;
    for (_, key) in keys.into_iter().skip(max) {
        registry.remove(&key);
    }
    evicted
}

/// Move the registry file aside once it exceeds `max_bytes`
///
/// The file is renamed to `<name>.bak.<ms>`; only the newest
/// [`MAX_REGISTRY_BACKUPS`] backups are kept. Returns whether a rotation
/// happened; a missing file is not rotated.
pub async fn rotate_registry_file(path: &Path, max_bytes: u64) -> Result<bool> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if meta.len() <= max_bytes {
        return Ok(false);
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| REGISTRY_FILE.to_string());
    let prefix = format!("{}.bak.", name);
    let backup = path.with_file_name(format!("{}{}", prefix, now_ms()));
    tokio::fs::rename(path, &backup).await?;
    info!(path = %path.display(), size = meta.len(), "rotated session registry");

    let Some(dir) = path.parent() else {
        return Ok(true);
    };
    let mut backups: Vec<(i64, PathBuf)> = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if let Some(ts) = file_name.strip_prefix(&prefix).and_then(|s| s.parse::<i64>().ok()) {
            backups.push((ts, entry.path()));
        }
    }
    backups.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, old) in backups.into_iter().skip(MAX_REGISTRY_BACKUPS) {
        if let Err(e) = tokio::fs::remove_file(&old).await {
            warn!(path = %old.display(), error = %e, "failed to remove old registry backup");
        }
    }
    Ok(true)
}

fn validate_agent_id(agent_id: &str) -> Result<()> {
    let valid = !agent_id.is_empty()
        && agent_id.len() <= 64
        && agent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid agent id: {:?}", agent_id)))
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(Error::InvalidInput("session key must not be empty".into()));
    }
    Ok(())
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Owner of every agent's registry and transcripts
#[derive(Debug)]
pub struct SessionStore {
    root: PathBuf,
    config: SessionsConfig,
    lock: Mutex<()>,
}

impl SessionStore {
    /// Create a store rooted at `root` (the agents directory)
    pub fn new(root: impl Into<PathBuf>, config: SessionsConfig) -> Self {
        SessionStore {
            root: root.into(),
            config,
            lock: Mutex::new(()),
        }
    }

    /// Create a store from the resolved configuration
    pub fn from_config(config: &Config) -> Self {
        let root = config
            .sessions
            .dir
            .clone()
            .unwrap_or_else(|| agents_dir(&config.resolved_state_dir()));
        Self::new(root, config.sessions.clone())
    }

    /// The requested agent, or the configured default
    pub fn agent_or_default<'a>(&'a self, agent_id: Option<&'a str>) -> &'a str {
        agent_id
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or(self.config.default_agent.as_str())
    }

    /// Directory holding one agent's registry and transcripts
    pub fn sessions_dir(&self, agent_id: &str) -> Result<PathBuf> {
        validate_agent_id(agent_id)?;
        Ok(self.root.join(agent_id).join("sessions"))
    }

    fn registry_path(&self, agent_id: &str) -> Result<PathBuf> {
        Ok(self.sessions_dir(agent_id)?.join(REGISTRY_FILE))
    }

    fn transcript_path(dir: &Path, entry: &SessionEntry) -> PathBuf {
        dir.join(entry.transcript_file_name())
    }

    /// Load an agent's registry; unreadable registries read as empty
    pub async fn load_registry(&self, agent_id: &str) -> Result<SessionRegistry> {
        Ok(read_json_or_default(&self.registry_path(agent_id)?).await)
    }

    /// Apply maintenance and atomically replace the registry file
    async fn save_registry(&self, agent_id: &str, registry: &mut SessionRegistry) -> Result<()> {
        let path = self.registry_path(agent_id)?;

        let pruned = prune_stale_entries(registry, self.config.prune_after, now_ms());
        let capped = cap_entry_count(registry, self.config.max_entries);
        if pruned + capped > 0 {
            debug!(agent = %agent_id, pruned, capped, "session registry maintenance");
        }
        rotate_registry_file(&path, self.config.rotate_bytes).await?;

        write_json_atomic(&path, registry).await
    }

    async fn create_transcript(dir: &Path) -> Result<SessionEntry> {
        tokio::fs::create_dir_all(dir).await?;
        let session_id = uuid::Uuid::new_v4().to_string();
        let entry = SessionEntry {
            session_id: session_id.clone(),
            updated_at: Some(now_ms()),
            session_file: None,
            label: None,
        };

        let mut header = serde_json::to_vec(&serde_json::json!({
            "type": "session",
            "id": session_id,
            "timestamp": timestamp(),
        }))?;
        header.push(b'\n');
        tokio::fs::write(Self::transcript_path(dir, &entry), header).await?;
        Ok(entry)
    }

    async fn resolve_locked(
        &self,
        agent_id: &str,
        key: &str,
        registry: &mut SessionRegistry,
    ) -> Result<(SessionEntry, bool)> {
        if let Some(entry) = registry.get(key) {
            return Ok((entry.clone(), false));
        }
        let dir = self.sessions_dir(agent_id)?;
        let entry = Self::create_transcript(&dir).await?;
        registry.insert(key.to_string(), entry.clone());
        info!(agent = %agent_id, key = %key, session_id = %entry.session_id, "created session");
        Ok((entry, true))
    }

    /// Registry entry for `key`, creating the session if needed
    pub async fn resolve_session(&self, agent_id: &str, key: &str) -> Result<SessionEntry> {
        validate_key(key)?;
        let _guard = self.lock.lock().await;
        let mut registry = self.load_registry(agent_id).await?;
        let (entry, created) = self.resolve_locked(agent_id, key, &mut registry).await?;
        if created {
            self.save_registry(agent_id, &mut registry).await?;
        }
        Ok(entry)
    }

    /// Append one message to the session's transcript
    pub async fn append_message(&self, agent_id: &str, key: &str, message: Value) -> Result<SessionEntry> {
        validate_key(key)?;
        let _guard = self.lock.lock().await;
        let mut registry = self.load_registry(agent_id).await?;
        let (mut entry, _) = self.resolve_locked(agent_id, key, &mut registry).await?;

        let dir = self.sessions_dir(agent_id)?;
        let mut line = serde_json::to_vec(&serde_json::json!({
            "type": "message",
            "timestamp": timestamp(),
            "message": message,
        }))?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::transcript_path(&dir, &entry))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        entry.updated_at = Some(now_ms());
        registry.insert(key.to_string(), entry.clone());
        self.save_registry(agent_id, &mut registry).await?;
        Ok(entry)
    }

    /// Messages of the session's active transcript, oldest first
    ///
    /// Header and malformed lines are skipped.
    pub async fn read_messages(&self, agent_id: &str, key: &str) -> Result<Vec<Value>> {
        let registry = self.load_registry(agent_id).await?;
        let entry = registry
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("session not found: {}", key)))?;
        let path = Self::transcript_path(&self.sessions_dir(agent_id)?, entry);

        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Ok(mut value) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            if value.get("type").and_then(Value::as_str) == Some("message") {
                if let Some(message) = value.get_mut("message") {
                    messages.push(message.take());
                }
            }
        }
        Ok(messages)
    }

    async fn archive_transcript(dir: &Path, entry: &SessionEntry, reason: &str) -> Result<Option<String>> {
        let path = Self::transcript_path(dir, entry);
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return Ok(None);
        };
        let archived = format!("{}.{}.{}", name, reason, format_archive_timestamp(Utc::now()));
        match tokio::fs::rename(&path, dir.join(&archived)).await {
            Ok(()) => Ok(Some(archived)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Archive the active transcript and start a fresh one under the same key
    pub async fn reset_session(&self, agent_id: &str, key: &str) -> Result<SessionReset> {
        validate_key(key)?;
        let _guard = self.lock.lock().await;
        let dir = self.sessions_dir(agent_id)?;
        let mut registry = self.load_registry(agent_id).await?;

        let previous = registry.get(key).cloned();
        let archived = match &previous {
            Some(entry) => Self::archive_transcript(&dir, entry, "reset").await?,
            None => None,
        };

        let mut entry = Self::create_transcript(&dir).await?;
        entry.label = previous.and_then(|p| p.label);
        registry.insert(key.to_string(), entry.clone());
        self.save_registry(agent_id, &mut registry).await?;

        info!(agent = %agent_id, key = %key, archived = ?archived, "reset session");
        Ok(SessionReset { entry, archived })
    }

    /// Remove the key and archive its transcript as deleted
    pub async fn delete_session(&self, agent_id: &str, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        let _guard = self.lock.lock().await;
        let dir = self.sessions_dir(agent_id)?;
        let mut registry = self.load_registry(agent_id).await?;

        let entry = registry
            .remove(key)
            .ok_or_else(|| Error::NotFound(format!("session not found: {}", key)))?;
        // Registry before rename: an interrupted delete leaves an orphan, not a dangling entry
        self.save_registry(agent_id, &mut registry).await?;
        let archived = Self::archive_transcript(&dir, &entry, "deleted").await?;

        info!(agent = %agent_id, key = %key, archived = ?archived, "deleted session");
        Ok(archived)
    }

    /// Active sessions, most recently updated first
    pub async fn list_sessions(&self, agent_id: &str, limit: Option<usize>) -> Result<Vec<SessionSummary>> {
        let registry = self.load_registry(agent_id).await?;
        let mut sessions: Vec<SessionSummary> = registry
            .into_iter()
            .map(|(key, entry)| SessionSummary {
                key,
                session_id: entry.session_id,
                updated_at: entry.updated_at,
                label: entry.label,
            })
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.key.cmp(&b.key)));
        if let Some(limit) = limit {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }

    /// Archived transcripts of one agent, newest first
    pub async fn list_archives(&self, agent_id: &str, limit: Option<u32>) -> Result<ArchivesListResult> {
        let dir = self.sessions_dir(agent_id)?;
        let registry = self.load_registry(agent_id).await?;
        let options = ArchiveListOptions {
            limit: clamp_limit(limit),
            message_count_max_bytes: self.config.message_count_max_bytes,
            orphan_grace: self.config.orphan_grace,
            now: SystemTime::now(),
        };

        tokio::task::spawn_blocking(move || archive::list_archives(&dir, &registry, &options)).await?
    }
}
