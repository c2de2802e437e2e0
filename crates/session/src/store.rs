//! Resume records kept by the sender between sessions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SessionError;

/// What a sender remembers about an unfinished upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRecord {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub chunk_size: u32,
    pub file_size: u64,
    pub name: String,
    #[serde(default)]
    pub done_indices: Vec<u32>,
    pub updated_at: DateTime<Utc>,
}

/// Opaque key-value storage for resume records.
pub trait SessionStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<ResumeRecord>, SessionError>;
    fn save(&self, key: &str, record: &ResumeRecord) -> Result<(), SessionError>;
    fn remove(&self, key: &str) -> Result<(), SessionError>;
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, ResumeRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<ResumeRecord>, SessionError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn save(&self, key: &str, record: &ResumeRecord) -> Result<(), SessionError> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), record.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SessionError> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// Store persisted to a single JSON file.
///
/// Records are cached in memory and the whole map is rewritten on change.
pub struct JsonFileStore {
    path: PathBuf,
    records: RwLock<HashMap<String, ResumeRecord>>,
}

impl JsonFileStore {
    /// Opens the store, loading existing records from disk.
    pub fn open(path: PathBuf) -> Result<Self, SessionError> {
        let records = load_records(&path)?;
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    /// Rewrites the file from `map`. Callers hold the write lock, so
    /// writers take turns and the newest map is always the last to land.
    fn persist(&self, map: &HashMap<String, ResumeRecord>) -> Result<(), SessionError> {
        let json = serde_json::to_string_pretty(map)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("persisted {} resume record(s) to {:?}", map.len(), self.path);
        Ok(())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ResumeRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionStore for JsonFileStore {
    fn load(&self, key: &str) -> Result<Option<ResumeRecord>, SessionError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn save(&self, key: &str, record: &ResumeRecord) -> Result<(), SessionError> {
        let mut map = self.write();
        map.insert(key.to_string(), record.clone());
        self.persist(&map)
    }

    fn remove(&self, key: &str) -> Result<(), SessionError> {
        let mut map = self.write();
        if map.remove(key).is_some() {
            self.persist(&map)?;
        }
        Ok(())
    }
}

fn load_records(path: &Path) -> Result<HashMap<String, ResumeRecord>, SessionError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let records: HashMap<String, ResumeRecord> = serde_json::from_str(&data)?;
    debug!("loaded {} resume record(s) from {:?}", records.len(), path);
    Ok(records)
}
