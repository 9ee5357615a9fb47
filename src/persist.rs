//! JSON file persistence helpers
//!
//! Writers replace files atomically (temp file + rename) so readers only ever
//! see a complete old or complete new document. Readers are tolerant: a file
//! that is missing, empty or unparseable yields the default value.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

/// Serialize `value` and atomically replace `path`
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');

    let temp = temp_path_for(path);
    if let Err(e) = tokio::fs::write(&temp, &bytes).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Read a JSON document, falling back to `T::default()` on any problem
pub async fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => T::default(),
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "unreadable JSON file, using empty state");
            T::default()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => T::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read JSON file, using empty state");
            T::default()
        }
    }
}

/// Whether a file name belongs to an in-progress atomic write
pub fn is_temp_file(name: &str) -> bool {
    name.ends_with(".tmp")
}
