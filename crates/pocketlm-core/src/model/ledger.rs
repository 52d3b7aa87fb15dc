//! Durable download-state ledger.
//!
//! The ledger is the source of truth for per-model download completion and
//! progress; the in-memory registry is a projection rebuilt from it. All
//! entries are serialized into one JSON document stored under a single
//! namespaced key, so a write is as atomic as the backing store's `set`.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Key the serialized record map is stored under.
pub const LEDGER_KEY: &str = "downloaded_models";

/// Durable string-keyed store backing the ledger.
///
/// Writes are assumed atomic at key granularity: after a crash mid-`set`,
/// `get` returns either the previous or the new value, never a torn one.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Download state for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadLedgerEntry {
    #[serde(default)]
    pub is_downloaded: bool,
    #[serde(default)]
    pub download_progress: f32,
}

/// Partial update merged into a model's entry; `None` fields are preserved.
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerUpdate {
    pub is_downloaded: Option<bool>,
    pub download_progress: Option<f32>,
}

impl LedgerUpdate {
    /// A progress tick.
    pub fn progress(ratio: f32) -> Self {
        Self {
            is_downloaded: None,
            download_progress: Some(ratio),
        }
    }

    /// The completion record. Both fields move in one write so a crash can
    /// never leave a completed model with partial progress on record.
    pub fn completed() -> Self {
        Self {
            is_downloaded: Some(true),
            download_progress: Some(1.0),
        }
    }

    /// Reset to the initial state.
    pub fn cleared() -> Self {
        Self {
            is_downloaded: Some(false),
            download_progress: Some(0.0),
        }
    }
}

/// Durable record of per-model download completion and progress.
pub struct DownloadLedger {
    store: Arc<dyn KvStore>,
}

impl DownloadLedger {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Read one model's entry. A corrupt or unreadable record is absence,
    /// not an error.
    pub fn read(&self, model_id: &str) -> Option<DownloadLedgerEntry> {
        self.read_all().get(model_id).copied()
    }

    /// Snapshot of every recorded entry.
    pub fn read_all(&self) -> HashMap<String, DownloadLedgerEntry> {
        let raw = match self.store.get(LEDGER_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return HashMap::new(),
            Err(err) => {
                warn!("ledger read failed, treating as empty: {err}");
                return HashMap::new();
            }
        };

        match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("discarding corrupt ledger record: {err}");
                HashMap::new()
            }
        }
    }

    /// Merge `update` into the model's entry and persist the whole record
    /// map in a single store write.
    pub fn write(&self, model_id: &str, update: LedgerUpdate) -> Result<()> {
        let mut entries = self.read_all();
        let entry = entries.entry(model_id.to_string()).or_default();
        if let Some(is_downloaded) = update.is_downloaded {
            entry.is_downloaded = is_downloaded;
        }
        if let Some(progress) = update.download_progress {
            entry.download_progress = progress;
        }

        let raw = serde_json::to_string(&entries)
            .map_err(|err| Error::Persistence(format!("failed to serialize ledger: {err}")))?;
        self.store.set(LEDGER_KEY, &raw)
    }

    /// Reset a model's entry to the initial state.
    pub fn clear(&self, model_id: &str) -> Result<()> {
        self.write(model_id, LedgerUpdate::cleared())
    }
}

/// File-backed store: one JSON file per key under `root`.
///
/// `set` writes a sibling temp file and renames it over the target, which is
/// where the ledger's crash atomicity comes from on a POSIX filesystem.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_of(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_of(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::Persistence(format!("failed to read {key}: {err}"))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.root)
            .map_err(|err| Error::Persistence(format!("failed to create store dir: {err}")))?;
        let target = self.path_of(key);
        let staging = self.root.join(format!("{key}.json.tmp"));
        fs::write(&staging, value)
            .map_err(|err| Error::Persistence(format!("failed to stage {key}: {err}")))?;
        fs::rename(&staging, &target)
            .map_err(|err| Error::Persistence(format!("failed to commit {key}: {err}")))?;
        Ok(())
    }
}

/// In-memory store, useful for tests and ephemeral hosts.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
