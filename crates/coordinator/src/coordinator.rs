use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use chunkup_protocol::TaskFingerprint;
use chunkup_protocol::messages::{
    CheckExistingRequest, CheckExistingResponse, DeleteTaskResponse, FinalizeRequest,
    FinalizeResponse, HealthResponse, InitializeTaskRequest, InitializeTaskResponse,
    ListMissingRequest, ListMissingResponse, SendChunkRequest, SendChunkResponse,
    TaskStatusResponse,
};
use chunkup_transfer::{DigestAlgorithm, checksum_bytes, validate_artifact_name};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::registry::{Registry, TaskEntry, TaskRecord};
use crate::store::{ChunkStore, discard};

/// Receiver side of the transfer protocol.
///
/// Tracks in-flight tasks, persists chunks in any arrival order and
/// reassembles complete tasks into published artifacts.
pub struct Coordinator {
    config: CoordinatorConfig,
    store: ChunkStore,
    registry: Registry,
}

impl Coordinator {
    /// Opens the coordinator at `config.root_dir`, recovering tasks left on
    /// disk by a previous run.
    pub async fn open(config: CoordinatorConfig) -> Result<Self, CoordinatorError> {
        let store = ChunkStore::new(config.chunks_dir(), config.artifacts_dir());
        store.ensure_layout().await?;

        let registry = Registry::new();
        let mut recovered = 0usize;
        for record in store.load_records().await? {
            let mut received = store.chunk_indices(&record.task_id).await?;
            received.retain(|&i| i < record.chunk_count);
            let task_id = record.task_id.clone();
            let (_, inserted) = registry.insert_or_get(Arc::new(TaskEntry::new(record, received)));
            if inserted {
                recovered += 1;
            } else {
                warn!(task_id = %task_id, "duplicate task on disk, ignoring");
            }
        }

        info!(
            root = %config.root_dir.display(),
            tasks = recovered,
            "coordinator opened"
        );
        Ok(Self {
            config,
            store,
            registry,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Number of tasks currently registered.
    pub fn active_tasks(&self) -> usize {
        self.registry.len()
    }

    /// Reports whether an artifact with this fingerprint is already published.
    pub async fn check_existing(
        &self,
        req: &CheckExistingRequest,
    ) -> Result<CheckExistingResponse, CoordinatorError> {
        validate_name(&req.name)?;
        if DigestAlgorithm::detect(&req.digest).is_none() {
            return Err(CoordinatorError::InvalidRequest(format!(
                "malformed digest: {}",
                req.digest
            )));
        }

        let location = self
            .store
            .find_artifact(&req.digest, &req.name, req.size)
            .await;
        debug!(digest = %req.digest, name = %req.name, exists = location.is_some(), "existence check");
        Ok(CheckExistingResponse {
            exists: location.is_some(),
            location: location.map(|p| p.display().to_string()),
        })
    }

    /// Creates a task, or returns the live task for the same identity.
    pub async fn initialize(
        &self,
        req: &InitializeTaskRequest,
    ) -> Result<InitializeTaskResponse, CoordinatorError> {
        validate_name(&req.name)?;
        if req.size == 0 {
            return Err(CoordinatorError::InvalidRequest("size must be greater than zero".into()));
        }
        if req.chunk_size == 0 || req.chunk_size > self.config.max_chunk_size {
            return Err(CoordinatorError::InvalidRequest(format!(
                "chunk size {} outside 1..={}",
                req.chunk_size, self.config.max_chunk_size
            )));
        }
        let expected_count = chunkup_transfer::chunk_count(req.size, req.chunk_size)
            .map_err(|e| CoordinatorError::InvalidRequest(e.to_string()))?;
        if req.chunk_count != expected_count {
            return Err(CoordinatorError::InvalidRequest(format!(
                "chunk count {} does not match size {} / chunk size {} (expected {expected_count})",
                req.chunk_count, req.size, req.chunk_size
            )));
        }
        if let Some(digest) = &req.digest
            && DigestAlgorithm::detect(digest).is_none()
        {
            return Err(CoordinatorError::InvalidRequest(format!("malformed digest: {digest}")));
        }

        if let Some(existing) = self.find_resumable(req) {
            if same_geometry(&existing.record, req) {
                let missing = existing.missing(existing.record.chunk_count);
                info!(
                    task_id = %existing.task_id(),
                    missing = missing.len(),
                    "task resumed"
                );
                return Ok(InitializeTaskResponse {
                    task_id: existing.task_id().to_string(),
                    missing_indices: missing,
                    resumed: true,
                });
            }
            warn!(
                task_id = %existing.task_id(),
                "chunk geometry changed, discarding previous task"
            );
            self.discard_task(&existing).await?;
        }

        let task_id = match &req.digest {
            Some(digest) => derive_task_id(digest, req.size, &req.name),
            None => uuid::Uuid::new_v4().simple().to_string(),
        };
        let record = TaskRecord {
            task_id,
            digest: req.digest.clone(),
            name: req.name.clone(),
            size: req.size,
            chunk_size: req.chunk_size,
            chunk_count: req.chunk_count,
            created_at: Utc::now(),
        };
        self.store.create_task(&record).await?;

        let (entry, inserted) = self
            .registry
            .insert_or_get(Arc::new(TaskEntry::new(record, BTreeSet::new())));
        if inserted {
            info!(
                task_id = %entry.task_id(),
                name = %entry.record.name,
                size = entry.record.size,
                chunks = entry.record.chunk_count,
                "task created"
            );
        }
        Ok(InitializeTaskResponse {
            task_id: entry.task_id().to_string(),
            missing_indices: entry.missing(entry.record.chunk_count),
            resumed: !inserted,
        })
    }

    /// Persists one chunk of a task.
    pub async fn receive_chunk(
        &self,
        req: &SendChunkRequest,
        data: &[u8],
    ) -> Result<SendChunkResponse, CoordinatorError> {
        let entry = self.task(&req.task_id)?;
        let chunk_count = entry.record.chunk_count;
        if req.index >= chunk_count {
            return Err(CoordinatorError::InvalidIndex {
                index: req.index,
                chunk_count,
            });
        }
        if data.len() > self.config.max_chunk_size as usize {
            return Err(CoordinatorError::InvalidRequest(format!(
                "chunk of {} bytes exceeds limit of {}",
                data.len(),
                self.config.max_chunk_size
            )));
        }

        if let Some(expected) = &req.chunk_digest {
            let algorithm = DigestAlgorithm::detect(expected).ok_or_else(|| {
                CoordinatorError::InvalidRequest(format!("malformed chunk digest: {expected}"))
            })?;
            let actual = checksum_bytes(algorithm, data);
            if &actual != expected {
                warn!(task_id = %req.task_id, index = req.index, "chunk digest mismatch");
                return Err(CoordinatorError::ChunkDigestMismatch {
                    index: req.index,
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        if let Err(e) = self.store.write_chunk(&req.task_id, req.index, data).await {
            if entry.is_removed() {
                return Err(CoordinatorError::UnknownTask(req.task_id.clone()));
            }
            return Err(e.into());
        }
        let fresh = entry.mark_received(req.index);
        debug!(
            task_id = %req.task_id,
            index = req.index,
            bytes = data.len(),
            duplicate = !fresh,
            "chunk stored"
        );

        Ok(SendChunkResponse {
            ok: true,
            index: req.index,
        })
    }

    /// Lists indices in `0..chunk_count` not yet received.
    pub fn list_missing(
        &self,
        req: &ListMissingRequest,
    ) -> Result<ListMissingResponse, CoordinatorError> {
        let entry = self.task(&req.task_id)?;
        let chunk_count = req.chunk_count.min(entry.record.chunk_count);
        Ok(ListMissingResponse {
            missing_indices: entry.missing(chunk_count),
        })
    }

    /// Reassembles a complete task, verifies it and publishes the artifact.
    ///
    /// On any verification failure the staging output is discarded and the
    /// task stays registered with its chunks intact.
    pub async fn finalize(
        &self,
        req: &FinalizeRequest,
    ) -> Result<FinalizeResponse, CoordinatorError> {
        let entry = match self.registry.get(&req.task_id) {
            Some(entry) => entry,
            None => return self.already_published(req).await,
        };

        let _merge = entry.merge.lock().await;
        if entry.is_removed() {
            return self.already_published(req).await;
        }

        let record = &entry.record;
        let received = entry.received();
        let missing: Vec<u32> = (0..record.chunk_count)
            .filter(|i| !received.contains(i))
            .collect();
        if !missing.is_empty() {
            return Err(CoordinatorError::IncompleteTask { missing });
        }

        let expected_digest = req.digest.as_ref().or(record.digest.as_ref());
        let algorithm = match expected_digest {
            Some(d) => Some(DigestAlgorithm::detect(d).ok_or_else(|| {
                CoordinatorError::InvalidRequest(format!("malformed digest: {d}"))
            })?),
            None => None,
        };

        let assembled = self
            .store
            .assemble(record.task_id.as_str(), record.chunk_count, algorithm)
            .await?;

        if assembled.size != req.size {
            discard(&assembled.staging_path).await;
            warn!(task_id = %record.task_id, expected = req.size, actual = assembled.size, "size mismatch");
            return Err(CoordinatorError::SizeMismatch {
                expected: req.size,
                actual: assembled.size,
            });
        }
        if let (Some(expected), Some(actual)) = (expected_digest, &assembled.digest)
            && expected != actual
        {
            discard(&assembled.staging_path).await;
            warn!(task_id = %record.task_id, "digest mismatch");
            return Err(CoordinatorError::DigestMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            });
        }

        let location = match self
            .store
            .publish(&assembled.staging_path, record.artifact_key(), &record.name)
            .await
        {
            Ok(location) => location,
            Err(e) => {
                discard(&assembled.staging_path).await;
                return Err(e.into());
            }
        };

        self.registry.remove(&record.task_id);
        if let Err(e) = self.store.remove_task(&record.task_id).await {
            warn!(task_id = %record.task_id, error = %e, "failed to remove chunk directory");
        }

        info!(
            task_id = %record.task_id,
            location = %location.display(),
            size = assembled.size,
            "task merged"
        );
        Ok(FinalizeResponse {
            artifact_location: location.display().to_string(),
            final_size: assembled.size,
        })
    }

    /// Discards a task and its chunk storage.
    pub async fn delete_task(&self, task_id: &str) -> Result<DeleteTaskResponse, CoordinatorError> {
        let entry = self.task(task_id)?;
        let _merge = entry.merge.lock().await;
        if entry.is_removed() {
            return Err(CoordinatorError::UnknownTask(task_id.to_string()));
        }
        self.discard_task(&entry).await?;
        info!(task_id, "task deleted");
        Ok(DeleteTaskResponse { ok: true })
    }

    /// Progress of a task.
    pub fn task_status(&self, task_id: &str) -> Result<TaskStatusResponse, CoordinatorError> {
        let entry = self.task(task_id)?;
        let received: Vec<u32> = entry.received().into_iter().collect();
        let chunk_count = entry.record.chunk_count;
        let progress = if chunk_count == 0 {
            0.0
        } else {
            received.len() as f64 / chunk_count as f64 * 100.0
        };
        Ok(TaskStatusResponse {
            task_id: entry.task_id().to_string(),
            name: entry.record.name.clone(),
            size: entry.record.size,
            received_count: received.len() as u32,
            chunk_count,
            received_indices: received,
            progress,
        })
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "ok".into(),
            active_tasks: self.registry.len(),
        }
    }

    /// Removes tasks older than the retention window, complete or not.
    ///
    /// Tasks currently being merged or deleted are skipped. Returns the
    /// number of tasks removed.
    pub async fn sweep_expired(&self, now: chrono::DateTime<Utc>) -> usize {
        let retention = match chrono::Duration::from_std(self.config.retention) {
            Ok(r) => r,
            Err(_) => return 0,
        };
        let cutoff = now - retention;

        let mut removed = 0;
        for entry in self.registry.created_before(cutoff) {
            let Ok(_merge) = entry.merge.try_lock() else {
                debug!(task_id = %entry.task_id(), "task busy, skipping expiry");
                continue;
            };
            if entry.is_removed() {
                continue;
            }
            match self.discard_task(&entry).await {
                Ok(()) => {
                    removed += 1;
                    info!(
                        task_id = %entry.task_id(),
                        created_at = %entry.record.created_at,
                        "expired task removed"
                    );
                }
                Err(e) => warn!(task_id = %entry.task_id(), error = %e, "failed to expire task"),
            }
        }
        removed
    }

    fn task(&self, task_id: &str) -> Result<Arc<TaskEntry>, CoordinatorError> {
        self.registry
            .get(task_id)
            .ok_or_else(|| CoordinatorError::UnknownTask(task_id.to_string()))
    }

    fn find_resumable(&self, req: &InitializeTaskRequest) -> Option<Arc<TaskEntry>> {
        if let Some(digest) = &req.digest {
            return self.registry.find(&TaskFingerprint {
                digest: Some(digest.clone()),
                size: req.size,
                name: req.name.clone(),
            });
        }
        let token = req.token.as_deref()?;
        self.registry.get(token).filter(|e| {
            e.record.digest.is_none() && e.record.size == req.size && e.record.name == req.name
        })
    }

    async fn discard_task(&self, entry: &TaskEntry) -> Result<(), CoordinatorError> {
        self.registry.remove(entry.task_id());
        self.store.remove_task(entry.task_id()).await?;
        Ok(())
    }

    /// Answers a finalize for a task that no longer exists: succeeds if the
    /// artifact it would have produced is already published.
    async fn already_published(
        &self,
        req: &FinalizeRequest,
    ) -> Result<FinalizeResponse, CoordinatorError> {
        let key = req.digest.as_deref().unwrap_or(&req.task_id);
        match self.store.find_artifact(key, &req.name, req.size).await {
            Some(location) => Ok(FinalizeResponse {
                artifact_location: location.display().to_string(),
                final_size: req.size,
            }),
            None => Err(CoordinatorError::UnknownTask(req.task_id.clone())),
        }
    }
}

/// Deterministic task id for a digest-identified file.
pub fn derive_task_id(digest: &str, size: u64, name: &str) -> String {
    let hash = Sha256::digest(format!("{digest}:{size}:{name}").as_bytes());
    hex::encode(hash)[..32].to_string()
}

fn same_geometry(record: &TaskRecord, req: &InitializeTaskRequest) -> bool {
    record.chunk_size == req.chunk_size && record.chunk_count == req.chunk_count
}

fn validate_name(name: &str) -> Result<(), CoordinatorError> {
    validate_artifact_name(name).map_err(|e| CoordinatorError::InvalidRequest(e.to_string()))
}
