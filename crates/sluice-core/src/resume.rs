use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SluiceError};

/// Chunk completions between debounced resume-cache writes.
pub(crate) const CACHE_WRITE_INTERVAL: usize = 8;

/// Locally persisted progress of one upload, keyed by content hash +
/// file name.
///
/// Lets a restarted process resume without re-reading server state from
/// scratch — but it is only a hint: the remote `check`/`verify` answer
/// always overrides the cached chunk set before anything is dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeEntry {
    pub file_hash: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: usize,
    pub uploaded_chunks: Vec<usize>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Directory of per-upload resume entries, one JSON file each.
#[derive(Debug, Clone)]
pub struct ResumeStore {
    dir: PathBuf,
}

impl ResumeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(SluiceError::Io)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the entry for `(file_hash, file_name)`, if any. A corrupt
    /// entry is treated as absent.
    pub fn load(&self, file_hash: &str, file_name: &str) -> Option<ResumeEntry> {
        let path = self.entry_path(file_hash, file_name);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<ResumeEntry>(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("ignoring corrupt resume entry {}: {e}", path.display());
                None
            }
        }
    }

    pub fn save(&self, entry: &ResumeEntry) -> Result<()> {
        let path = self.entry_path(&entry.file_hash, &entry.file_name);
        let raw = serde_json::to_string_pretty(entry)?;
        std::fs::write(&path, raw).map_err(SluiceError::Io)?;
        debug!(
            chunks = entry.uploaded_chunks.len(),
            total = entry.total_chunks,
            "wrote resume entry {}",
            path.display()
        );
        Ok(())
    }

    /// Best-effort save: failures only warn, the upload continues.
    pub fn save_best_effort(&self, entry: &ResumeEntry) {
        if let Err(e) = self.save(entry) {
            warn!("failed to write resume entry: {e}");
        }
    }

    /// Remove the entry on terminal success/cancel. Missing files are fine.
    pub fn remove(&self, file_hash: &str, file_name: &str) {
        let path = self.entry_path(file_hash, file_name);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove resume entry {}: {e}", path.display());
            }
        }
    }

    /// List all persisted entries, skipping unreadable ones.
    pub fn list(&self) -> Vec<ResumeEntry> {
        let Ok(read_dir) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut entries: Vec<ResumeEntry> = read_dir
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .filter_map(|e| {
                let raw = std::fs::read_to_string(e.path()).ok()?;
                serde_json::from_str(&raw).ok()
            })
            .collect();
        entries.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        entries
    }

    fn entry_path(&self, file_hash: &str, file_name: &str) -> PathBuf {
        self.dir
            .join(format!("{}-{}.json", file_hash, sanitize(file_name)))
    }
}

/// Make a file name safe to embed in a cache file name.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
