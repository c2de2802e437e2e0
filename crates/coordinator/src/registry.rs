use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use chunkup_protocol::TaskFingerprint;
use serde::{Deserialize, Serialize};

/// Persisted description of a receiver task.
///
/// Received indices are not part of the record: the chunk files on disk
/// are the durable source of truth for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub name: String,
    pub size: u64,
    pub chunk_size: u32,
    pub chunk_count: u32,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Content fingerprint, present only for digest-identified tasks.
    pub fn fingerprint(&self) -> Option<TaskFingerprint> {
        self.digest.as_ref().map(|digest| TaskFingerprint {
            digest: Some(digest.clone()),
            size: self.size,
            name: self.name.clone(),
        })
    }

    /// Key used to name the published artifact.
    pub fn artifact_key(&self) -> &str {
        self.digest.as_deref().unwrap_or(&self.task_id)
    }
}

/// A live task: its immutable record plus mutable chunk bookkeeping.
#[derive(Debug)]
pub struct TaskEntry {
    pub record: TaskRecord,
    received: Mutex<BTreeSet<u32>>,
    removed: AtomicBool,
    /// Serializes finalize, delete and expiry for this task.
    pub(crate) merge: tokio::sync::Mutex<()>,
}

impl TaskEntry {
    pub fn new(record: TaskRecord, received: BTreeSet<u32>) -> Self {
        Self {
            record,
            received: Mutex::new(received),
            removed: AtomicBool::new(false),
            merge: tokio::sync::Mutex::new(()),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.record.task_id
    }

    /// Records a persisted chunk. Returns `true` if the index is new.
    pub fn mark_received(&self, index: u32) -> bool {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index)
    }

    /// Snapshot of the received indices.
    pub fn received(&self) -> BTreeSet<u32> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn received_count(&self) -> u32 {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len() as u32
    }

    /// Indices in `0..chunk_count` not yet received, ascending.
    pub fn missing(&self, chunk_count: u32) -> Vec<u32> {
        let received = self.received.lock().unwrap_or_else(PoisonError::into_inner);
        (0..chunk_count).filter(|i| !received.contains(i)).collect()
    }

    /// Whether the task has been removed from the registry.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct RegistryInner {
    tasks: HashMap<String, Arc<TaskEntry>>,
    by_fingerprint: HashMap<TaskFingerprint, String>,
}

/// In-memory task registry with a secondary fingerprint index.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<TaskEntry>> {
        self.read().tasks.get(task_id).cloned()
    }

    /// Looks up the task registered for a content fingerprint.
    pub fn find(&self, fingerprint: &TaskFingerprint) -> Option<Arc<TaskEntry>> {
        let inner = self.read();
        inner
            .by_fingerprint
            .get(fingerprint)
            .and_then(|id| inner.tasks.get(id))
            .cloned()
    }

    /// Inserts `entry` unless a task with the same id or fingerprint is
    /// already registered, in which case the existing task is returned.
    ///
    /// The boolean is `true` when `entry` was inserted.
    pub fn insert_or_get(&self, entry: Arc<TaskEntry>) -> (Arc<TaskEntry>, bool) {
        let mut inner = self.write();
        let fingerprint = entry.record.fingerprint();

        if let Some(existing) = fingerprint
            .as_ref()
            .and_then(|fp| inner.by_fingerprint.get(fp))
            .and_then(|id| inner.tasks.get(id))
        {
            return (Arc::clone(existing), false);
        }
        if let Some(existing) = inner.tasks.get(entry.task_id()) {
            return (Arc::clone(existing), false);
        }

        let id = entry.task_id().to_string();
        if let Some(fp) = fingerprint {
            inner.by_fingerprint.insert(fp, id.clone());
        }
        inner.tasks.insert(id, Arc::clone(&entry));
        (entry, true)
    }

    /// Removes a task and marks it as removed.
    pub fn remove(&self, task_id: &str) -> Option<Arc<TaskEntry>> {
        let mut inner = self.write();
        let entry = inner.tasks.remove(task_id)?;
        if let Some(fp) = entry.record.fingerprint()
            && inner.by_fingerprint.get(&fp).is_some_and(|id| id == task_id)
        {
            inner.by_fingerprint.remove(&fp);
        }
        entry.removed.store(true, Ordering::Release);
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.read().tasks.len()
    }

    /// Tasks created strictly before `cutoff`.
    pub fn created_before(&self, cutoff: DateTime<Utc>) -> Vec<Arc<TaskEntry>> {
        self.read()
            .tasks
            .values()
            .filter(|e| e.record.created_at < cutoff)
            .cloned()
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(task_id: &str, digest: Option<&str>) -> TaskRecord {
        TaskRecord {
            task_id: task_id.into(),
            digest: digest.map(String::from),
            name: "a.bin".into(),
            size: 100,
            chunk_size: 10,
            chunk_count: 10,
            created_at: Utc::now(),
        }
    }

    fn entry(task_id: &str, digest: Option<&str>) -> Arc<TaskEntry> {
        Arc::new(TaskEntry::new(record(task_id, digest), BTreeSet::new()))
    }

    #[test]
    fn fingerprint_lookup() {
        let reg = Registry::new();
        let (_, inserted) = reg.insert_or_get(entry("t1", Some("abc")));
        assert!(inserted);

        let fp = TaskFingerprint {
            digest: Some("abc".into()),
            size: 100,
            name: "a.bin".into(),
        };
        assert_eq!(reg.find(&fp).unwrap().task_id(), "t1");
    }

    #[test]
    fn duplicate_fingerprint_returns_existing() {
        let reg = Registry::new();
        reg.insert_or_get(entry("t1", Some("abc")));
        let (existing, inserted) = reg.insert_or_get(entry("t2", Some("abc")));
        assert!(!inserted);
        assert_eq!(existing.task_id(), "t1");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn tokenless_tasks_are_not_indexed() {
        let reg = Registry::new();
        reg.insert_or_get(entry("t1", None));
        reg.insert_or_get(entry("t2", None));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn remove_clears_index_and_flags_entry() {
        let reg = Registry::new();
        let (e, _) = reg.insert_or_get(entry("t1", Some("abc")));
        let removed = reg.remove("t1").unwrap();
        assert!(removed.is_removed());
        assert!(e.is_removed());
        assert!(reg.get("t1").is_none());
        assert!(reg.find(&record("t1", Some("abc")).fingerprint().unwrap()).is_none());
        assert!(reg.remove("t1").is_none());
    }

    #[test]
    fn missing_and_received() {
        let e = TaskEntry::new(record("t", None), BTreeSet::from([0, 2, 5]));
        assert_eq!(e.missing(10), vec![1, 3, 4, 6, 7, 8, 9]);
        assert!(!e.mark_received(2));
        assert_eq!(e.received_count(), 3);
        assert!(e.mark_received(1));
        assert_eq!(e.missing(3), Vec::<u32>::new());
    }

    #[test]
    fn created_before_filters_by_age() {
        let reg = Registry::new();
        let mut old = record("old", None);
        old.created_at = Utc::now() - Duration::hours(25);
        reg.insert_or_get(Arc::new(TaskEntry::new(old, BTreeSet::new())));
        reg.insert_or_get(entry("new", None));

        let expired = reg.created_before(Utc::now() - Duration::hours(24));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].task_id(), "old");
    }

    #[test]
    fn artifact_key_prefers_digest() {
        assert_eq!(record("t", Some("d")).artifact_key(), "d");
        assert_eq!(record("t", None).artifact_key(), "t");
    }
}
