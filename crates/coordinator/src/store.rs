//! On-disk layout for receiver tasks and published artifacts.
//!
//! ```text
//! <root>/chunks/<taskId>/task.json
//! <root>/chunks/<taskId>/chunk_<index>
//! <root>/artifacts/<digest-or-taskId>_<name>
//! ```
//!
//! Every file is written to a unique temporary name first and renamed into
//! place, so a reader sees either the previous content or the complete new
//! content, never a partial write.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chunkup_transfer::{DigestAlgorithm, Hasher};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use crate::registry::TaskRecord;

const RECORD_FILE: &str = "task.json";
const CHUNK_PREFIX: &str = "chunk_";
const COPY_BUF_SIZE: usize = 1024 * 1024;

/// Result of concatenating a task's chunks into a staging file.
#[derive(Debug)]
pub struct Assembled {
    pub staging_path: PathBuf,
    pub size: u64,
    pub digest: Option<String>,
}

/// Filesystem storage for chunk directories and artifacts.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    chunks_dir: PathBuf,
    artifacts_dir: PathBuf,
}

impl ChunkStore {
    pub fn new(chunks_dir: PathBuf, artifacts_dir: PathBuf) -> Self {
        Self {
            chunks_dir,
            artifacts_dir,
        }
    }

    /// Creates the top-level directories if missing.
    pub async fn ensure_layout(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.chunks_dir).await?;
        tokio::fs::create_dir_all(&self.artifacts_dir).await
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.chunks_dir.join(task_id)
    }

    pub fn chunk_path(&self, task_id: &str, index: u32) -> PathBuf {
        self.task_dir(task_id).join(format!("{CHUNK_PREFIX}{index}"))
    }

    pub fn artifact_path(&self, key: &str, name: &str) -> PathBuf {
        self.artifacts_dir.join(format!("{key}_{name}"))
    }

    /// Creates the task directory and persists its record.
    pub async fn create_task(&self, record: &TaskRecord) -> std::io::Result<()> {
        let dir = self.task_dir(&record.task_id);
        tokio::fs::create_dir_all(&dir).await?;
        let json = serde_json::to_vec_pretty(record).map_err(std::io::Error::other)?;
        write_atomic(&dir, RECORD_FILE, &json).await
    }

    /// Persists one chunk. Rewriting an index replaces the previous bytes.
    pub async fn write_chunk(&self, task_id: &str, index: u32, data: &[u8]) -> std::io::Result<()> {
        let dir = self.task_dir(task_id);
        write_atomic(&dir, &format!("{CHUNK_PREFIX}{index}"), data).await
    }

    /// Lists the chunk indices present on disk for a task.
    pub async fn chunk_indices(&self, task_id: &str) -> std::io::Result<BTreeSet<u32>> {
        let mut indices = BTreeSet::new();
        let mut entries = tokio::fs::read_dir(self.task_dir(task_id)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(index) = name
                .to_str()
                .and_then(|n| n.strip_prefix(CHUNK_PREFIX))
                .and_then(|n| n.parse::<u32>().ok())
            {
                indices.insert(index);
            }
        }
        Ok(indices)
    }

    /// Loads every task record found under the chunks directory.
    ///
    /// Directories without a readable record are skipped.
    pub async fn load_records(&self) -> std::io::Result<Vec<TaskRecord>> {
        let mut records = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.chunks_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path().join(RECORD_FILE);
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping task without record");
                    continue;
                }
            };
            match serde_json::from_slice::<TaskRecord>(&data) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping corrupt task record"),
            }
        }
        Ok(records)
    }

    /// Removes a task directory and everything in it.
    pub async fn remove_task(&self, task_id: &str) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(self.task_dir(task_id)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Returns the artifact path if an artifact of exactly `size` bytes exists.
    pub async fn find_artifact(&self, key: &str, name: &str, size: u64) -> Option<PathBuf> {
        let path = self.artifact_path(key, name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() && meta.len() == size => Some(path),
            _ => None,
        }
    }

    /// Concatenates chunks `0..chunk_count` in index order into a staging
    /// file under the artifacts directory, hashing as it goes.
    pub async fn assemble(
        &self,
        task_id: &str,
        chunk_count: u32,
        algorithm: Option<DigestAlgorithm>,
    ) -> std::io::Result<Assembled> {
        let staging_path = self
            .artifacts_dir
            .join(format!(".{task_id}.{}.partial", uuid::Uuid::new_v4().simple()));

        match self
            .concat_chunks(task_id, chunk_count, algorithm, &staging_path)
            .await
        {
            Ok((size, hasher)) => Ok(Assembled {
                staging_path,
                size,
                digest: hasher.map(Hasher::finalize_hex),
            }),
            Err(e) => {
                discard(&staging_path).await;
                Err(e)
            }
        }
    }

    async fn concat_chunks(
        &self,
        task_id: &str,
        chunk_count: u32,
        algorithm: Option<DigestAlgorithm>,
        staging_path: &Path,
    ) -> std::io::Result<(u64, Option<Hasher>)> {
        let out = tokio::fs::File::create(staging_path).await?;
        let mut out = BufWriter::new(out);
        let mut hasher = algorithm.map(DigestAlgorithm::hasher);
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut size = 0u64;

        for index in 0..chunk_count {
            let mut chunk = tokio::fs::File::open(self.chunk_path(task_id, index)).await?;
            loop {
                let n = chunk.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                if let Some(h) = hasher.as_mut() {
                    h.update(&buf[..n]);
                }
                out.write_all(&buf[..n]).await?;
                size += n as u64;
            }
        }

        out.flush().await?;
        out.get_ref().sync_all().await?;
        debug!(task_id, chunk_count, size, "chunks concatenated");
        Ok((size, hasher))
    }

    /// Moves a verified staging file to its final artifact path.
    pub async fn publish(&self, staging_path: &Path, key: &str, name: &str) -> std::io::Result<PathBuf> {
        let target = self.artifact_path(key, name);
        tokio::fs::rename(staging_path, &target).await?;
        Ok(target)
    }
}

/// Deletes a staging file, logging instead of failing.
pub async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove staging file");
    }
}

async fn write_atomic(dir: &Path, file_name: &str, data: &[u8]) -> std::io::Result<()> {
    let tmp = dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));
    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, dir.join(file_name)).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}
