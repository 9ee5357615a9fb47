//! Archived transcript classification and listing
//!
//! Runs on blocking threads: the scan reads directory entries, the first
//! line of every candidate, and (under the size cap) whole files.

use std::collections::HashSet;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use super::{SessionRegistry, REGISTRY_FILE, TRANSCRIPT_EXT};
use crate::error::Result;
use crate::gateway::protocol::{ArchiveReason, ArchivesListResult, SessionArchiveEntry};
use crate::persist::is_temp_file;

/// Default page size for archive listing
pub const DEFAULT_ARCHIVE_LIMIT: usize = 50;
/// Largest page a caller may request
pub const MAX_ARCHIVE_LIMIT: usize = 200;
/// Longest first line read when looking for a transcript header
const MAX_HEADER_BYTES: u64 = 64 * 1024;

/// Knobs for [`list_archives`]
#[derive(Debug, Clone)]
pub struct ArchiveListOptions {
    /// Page size (already clamped)
    pub limit: usize,
    /// Files larger than this report no message count
    pub message_count_max_bytes: u64,
    /// Unreferenced transcripts younger than this are not reported
    pub orphan_grace: Duration,
    /// Reference time for the grace period
    pub now: SystemTime,
}

/// Clamp a requested page size into `1..=MAX_ARCHIVE_LIMIT`
pub fn clamp_limit(limit: Option<u32>) -> usize {
    limit
        .map(|l| (l as usize).clamp(1, MAX_ARCHIVE_LIMIT))
        .unwrap_or(DEFAULT_ARCHIVE_LIMIT)
}

/// Render a time as an archive file suffix (`:` is not portable in file names)
pub fn format_archive_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H-%M-%S%.3fZ").to_string()
}

/// Parse an archive file suffix into epoch milliseconds
///
/// Accepts the dashed ISO form written by [`format_archive_timestamp`], a
/// regular RFC 3339 timestamp, or plain epoch milliseconds.
pub fn parse_archive_timestamp(raw: &str) -> Option<i64> {
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw.parse().ok();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H-%M-%S%.fZ")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H-%M-%SZ"))
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// How a file in the sessions directory relates to archiving
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileClass {
    /// Not a transcript (registry, lock, temp or unrelated file)
    Ignored,
    /// Plain transcript; active or orphaned depending on the registry
    Transcript,
    /// Suffixed archive with its raw timestamp
    Archived(ArchiveReason, String),
}

/// Classify a file name from the sessions directory
pub fn classify_file(name: &str) -> FileClass {
    if name == REGISTRY_FILE
        || name.starts_with(&format!("{}.", REGISTRY_FILE))
        || name.ends_with(".lock")
        || name.starts_with('.')
        || is_temp_file(name)
    {
        return FileClass::Ignored;
    }

    for (marker, reason) in [
        (".reset.", ArchiveReason::Reset),
        (".deleted.", ArchiveReason::Deleted),
        (".bak.", ArchiveReason::Bak),
    ] {
        let needle = format!(".{}{}", TRANSCRIPT_EXT, marker);
        if let Some(pos) = name.find(&needle) {
            let suffix = &name[pos + needle.len()..];
            return FileClass::Archived(reason, suffix.to_string());
        }
    }

    if name.ends_with(&format!(".{}", TRANSCRIPT_EXT)) {
        FileClass::Transcript
    } else {
        FileClass::Ignored
    }
}

/// File names the registry still points at
pub fn referenced_files(registry: &SessionRegistry) -> HashSet<String> {
    registry.values().map(|entry| entry.transcript_file_name()).collect()
}

#[derive(Debug, Default, Deserialize)]
struct Header {
    #[serde(rename = "type")]
    kind: Option<String>,
    id: Option<String>,
    timestamp: Option<serde_json::Value>,
}

/// Session id and creation time from a transcript's first line
fn read_header(path: &Path) -> (Option<String>, Option<i64>) {
    let Ok(file) = fs::File::open(path) else {
        return (None, None);
    };
    let mut line = String::new();
    // Bounded so a file without newlines is never read whole
    if BufReader::new(file.take(MAX_HEADER_BYTES)).read_line(&mut line).is_err() {
        return (None, None);
    }
    let header: Header = match serde_json::from_str(line.trim()) {
        Ok(header) => header,
        Err(_) => return (None, None),
    };
    if header.kind.as_deref() != Some("session") {
        return (None, None);
    }

    let created_at = match header.timestamp {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => parse_archive_timestamp(&s),
        _ => None,
    };
    (header.id, created_at)
}

/// Count message lines, skipping the header and malformed lines
fn count_messages(path: &Path) -> Option<u64> {
    let file = fs::File::open(path).ok()?;
    let mut count = 0;
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { continue };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) if value.get("type").and_then(|t| t.as_str()) == Some("session") => {}
            Ok(_) => count += 1,
            Err(_) => {}
        }
    }
    Some(count)
}

fn millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn session_id_from_name(name: &str) -> String {
    let ext = format!(".{}", TRANSCRIPT_EXT);
    match name.find(&ext) {
        Some(pos) => name[..pos].to_string(),
        None => name.to_string(),
    }
}

/// List archived transcripts in `dir`, newest first
///
/// A missing directory yields an empty listing. `total` counts every
/// archived transcript before the page is cut.
pub fn list_archives(
    dir: &Path,
    registry: &SessionRegistry,
    options: &ArchiveListOptions,
) -> Result<ArchivesListResult> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ArchivesListResult::default()),
        Err(e) => return Err(e.into()),
    };

    let referenced = referenced_files(registry);
    let mut archives = Vec::new();

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let class = classify_file(&name);
        if class == FileClass::Ignored {
            continue;
        }

        // Files can vanish between readdir and stat
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(UNIX_EPOCH);

        let (reason, archived_at) = match class {
            FileClass::Archived(reason, suffix) => {
                let at = parse_archive_timestamp(&suffix).unwrap_or_else(|| millis(modified));
                (reason, at)
            }
            FileClass::Transcript => {
                if referenced.contains(&name) {
                    continue;
                }
                let age = options.now.duration_since(modified).unwrap_or(Duration::ZERO);
                if age < options.orphan_grace {
                    continue;
                }
                (ArchiveReason::Orphaned, millis(modified))
            }
            FileClass::Ignored => continue,
        };

        let path = entry.path();
        let (header_id, created_at) = read_header(&path);
        let size_bytes = meta.len();
        let message_count = if size_bytes <= options.message_count_max_bytes {
            count_messages(&path)
        } else {
            None
        };

        archives.push(SessionArchiveEntry {
            session_id: header_id.unwrap_or_else(|| session_id_from_name(&name)),
            file_name: name,
            archive_reason: reason,
            archived_at,
            created_at,
            size_bytes,
            message_count,
        });
    }

    archives.sort_by(|a, b| {
        b.archived_at
            .cmp(&a.archived_at)
            .then_with(|| a.file_name.cmp(&b.file_name))
    });
    let total = archives.len();
    archives.truncate(options.limit);

    Ok(ArchivesListResult { archives, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionEntry;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn options(limit: usize) -> ArchiveListOptions {
        ArchiveListOptions {
            limit,
            message_count_max_bytes: 1024 * 1024,
            orphan_grace: Duration::ZERO,
            now: SystemTime::now(),
        }
    }

    fn write_transcript(dir: &Path, name: &str, id: &str, messages: usize) {
        let mut body = format!("{{\"type\":\"session\",\"id\":\"{}\",\"timestamp\":\"2026-01-02T03:04:05.000Z\"}}\n", id);
        for n in 0..messages {
            body.push_str(&format!("{{\"type\":\"message\",\"message\":{{\"n\":{}}}}}\n", n));
        }
        fs::write(dir.join(name), body).unwrap();
    }

    fn registry_with(id: &str) -> SessionRegistry {
        let mut registry = SessionRegistry::new();
        registry.insert(
            "main".into(),
            SessionEntry {
                session_id: id.into(),
                updated_at: Some(1),
                session_file: None,
                label: None,
            },
        );
        registry
    }

    #[test]
    fn test_timestamp_formats() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        let suffix = format_archive_timestamp(at);
        assert_eq!(suffix, "2026-03-04T05-06-07.000Z");
        assert!(!suffix.contains(':'));
        assert_eq!(parse_archive_timestamp(&suffix), Some(at.timestamp_millis()));
        assert_eq!(parse_archive_timestamp("1700000000000"), Some(1_700_000_000_000));
        assert_eq!(
            parse_archive_timestamp("2026-03-04T05:06:07Z"),
            Some(at.timestamp_millis())
        );
        assert_eq!(parse_archive_timestamp("yesterday"), None);
    }

    #[test]
    fn test_classify_file() {
        assert_eq!(classify_file("sessions.json"), FileClass::Ignored);
        assert_eq!(classify_file("sessions.json.bak.1700000000000"), FileClass::Ignored);
        assert_eq!(classify_file("abc.jsonl.lock"), FileClass::Ignored);
        assert_eq!(classify_file(".sessions.json.1234.tmp"), FileClass::Ignored);
        assert_eq!(classify_file("notes.txt"), FileClass::Ignored);
        assert_eq!(classify_file("abc.jsonl"), FileClass::Transcript);
        assert_eq!(
            classify_file("abc.jsonl.reset.2026-03-04T05-06-07.000Z"),
            FileClass::Archived(ArchiveReason::Reset, "2026-03-04T05-06-07.000Z".into())
        );
        assert_eq!(
            classify_file("abc.jsonl.deleted.1700000000000"),
            FileClass::Archived(ArchiveReason::Deleted, "1700000000000".into())
        );
        assert_eq!(
            classify_file("abc.jsonl.bak.1700000000000"),
            FileClass::Archived(ArchiveReason::Bak, "1700000000000".into())
        );
    }

    #[test]
    fn test_registry_path_marks_transcript_active() {
        let dir = tempdir().unwrap();
        write_transcript(dir.path(), "s1.jsonl", "s1", 1);

        let mut registry = registry_with("s1");
        if let Some(entry) = registry.get_mut("main") {
            entry.session_file = Some(dir.path().join("s1.jsonl").to_string_lossy().into_owned());
        }

        let result = list_archives(dir.path(), &registry, &options(50)).unwrap();
        assert_eq!(result.total, 0);
        assert!(result.archives.is_empty());
    }

    #[test]
    fn test_header_read_is_bounded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.jsonl");
        fs::write(&path, "x".repeat(MAX_HEADER_BYTES as usize * 2)).unwrap();
        assert_eq!(read_header(&path), (None, None));

        let mut header = String::from("{\"type\":\"session\",\"id\":\"s9\",\"timestamp\":5}\n");
        header.push_str(&"y".repeat(MAX_HEADER_BYTES as usize * 2));
        fs::write(&path, header).unwrap();
        assert_eq!(read_header(&path), (Some("s9".to_string()), Some(5)));
    }

    #[test]
    fn test_active_reset_and_orphaned_transcripts() {
        let dir = tempdir().unwrap();
        let reset_at = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();

        write_transcript(dir.path(), "s1.jsonl", "s1", 2);
        write_transcript(
            dir.path(),
            &format!("s1.jsonl.reset.{}", format_archive_timestamp(reset_at)),
            "s1",
            3,
        );
        write_transcript(dir.path(), "s2.jsonl", "s2", 1);
        fs::write(dir.path().join("sessions.json"), "{}").unwrap();
        fs::write(dir.path().join("s1.jsonl.lock"), "").unwrap();

        let result = list_archives(dir.path(), &registry_with("s1"), &options(50)).unwrap();

        assert_eq!(result.total, 2);
        assert!(result.archives.iter().all(|a| a.file_name != "s1.jsonl"));

        let reset = result
            .archives
            .iter()
            .find(|a| a.archive_reason == ArchiveReason::Reset)
            .unwrap();
        assert_eq!(reset.archived_at, reset_at.timestamp_millis());
        assert_eq!(reset.session_id, "s1");
        assert_eq!(reset.message_count, Some(3));
        assert_eq!(
            reset.created_at,
            Some(Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap().timestamp_millis())
        );

        let orphan = result
            .archives
            .iter()
            .find(|a| a.archive_reason == ArchiveReason::Orphaned)
            .unwrap();
        assert_eq!(orphan.file_name, "s2.jsonl");
        let mtime = fs::metadata(dir.path().join("s2.jsonl")).unwrap().modified().unwrap();
        assert_eq!(orphan.archived_at, millis(mtime));

        // Orphan (mtime now) sorts ahead of the 2020 reset
        assert_eq!(result.archives[0].archive_reason, ArchiveReason::Orphaned);
    }

    #[test]
    fn test_sorted_and_truncated_with_total() {
        let dir = tempdir().unwrap();
        for (n, ts) in [1_000i64, 3_000, 2_000].iter().enumerate() {
            write_transcript(dir.path(), &format!("s{}.jsonl.deleted.{}", n, ts), &format!("s{}", n), 0);
        }

        let result = list_archives(dir.path(), &SessionRegistry::new(), &options(2)).unwrap();
        assert_eq!(result.total, 3);
        let times: Vec<i64> = result.archives.iter().map(|a| a.archived_at).collect();
        assert_eq!(times, vec![3_000, 2_000]);
    }

    #[test]
    fn test_malformed_header_and_size_cap() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("abc.jsonl.bak.1700000000000"),
            "not json\n{\"type\":\"message\"}\n{broken\n",
        )
        .unwrap();
        write_transcript(dir.path(), "big.jsonl.deleted.1", "big", 50);

        let opts = ArchiveListOptions {
            message_count_max_bytes: 200,
            ..options(50)
        };
        let result = list_archives(dir.path(), &SessionRegistry::new(), &opts).unwrap();

        let bak = result.archives.iter().find(|a| a.file_name.starts_with("abc")).unwrap();
        assert_eq!(bak.session_id, "abc");
        assert_eq!(bak.created_at, None);
        assert_eq!(bak.message_count, Some(1));

        let big = result.archives.iter().find(|a| a.session_id == "big").unwrap();
        assert_eq!(big.message_count, None);
    }

    #[test]
    fn test_orphan_grace_hides_fresh_files() {
        let dir = tempdir().unwrap();
        write_transcript(dir.path(), "fresh.jsonl", "fresh", 1);

        let opts = ArchiveListOptions {
            orphan_grace: Duration::from_secs(3600),
            ..options(50)
        };
        let result = list_archives(dir.path(), &SessionRegistry::new(), &opts).unwrap();
        assert_eq!(result.total, 0);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        let result = list_archives(&dir.path().join("nope"), &SessionRegistry::new(), &options(50)).unwrap();
        assert_eq!(result, ArchivesListResult::default());
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None), DEFAULT_ARCHIVE_LIMIT);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(500)), MAX_ARCHIVE_LIMIT);
        assert_eq!(clamp_limit(Some(7)), 7);
    }
}
