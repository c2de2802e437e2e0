//! Sender-side transfer session.
//!
//! A session owns the chunk table for one file and drives it through
//! `Idle -> Digesting -> CheckingExisting -> Uploading <-> Paused -> Completed`.
//! While uploading, a single dispatch loop claims pending chunks in
//! ascending index order and keeps at most `max_concurrent` transmissions
//! in flight. Every state mutation happens under one lock and is discarded
//! if the run it belongs to has been cancelled by pause, cancel or failure.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use chunkup_protocol::constants::REQUEST_TIMEOUT;
use chunkup_protocol::messages::{
    CheckExistingRequest, DeleteTaskRequest, FinalizeRequest, FinalizeResponse,
    InitializeTaskRequest, ListMissingRequest, SendChunkRequest,
};
use chunkup_protocol::{ErrorClass, ErrorKind};
use chunkup_transfer::{
    ChunkDescriptor, Digester, ProgressSnapshot, SpeedCalculator, TransferError, checksum_bytes,
    partition, read_chunk, validate_artifact_name,
};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::SessionEvent;
use crate::retry::RetryDecision;
use crate::store::{ResumeRecord, SessionStore};
use crate::transport::{TransportError, UploadTransport};

const EVENT_CAPACITY: usize = 256;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Idle,
    Digesting,
    CheckingExisting,
    Uploading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Done,
    /// Failed and waiting for its backoff delay.
    Failed,
}

/// Sender-side state of one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkState {
    pub descriptor: ChunkDescriptor,
    pub status: ChunkStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl ChunkState {
    fn new(descriptor: ChunkDescriptor) -> Self {
        Self {
            descriptor,
            status: ChunkStatus::Pending,
            retry_count: 0,
            last_error: None,
        }
    }
}

/// The published artifact of a completed session.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub location: String,
    pub size: u64,
    /// `true` when the receiver already held the content.
    pub instant: bool,
}

struct State {
    status: SessionStatus,
    chunks: Vec<ChunkState>,
    /// Claimable indices. The lowest is always dispatched first.
    pending: BTreeSet<u32>,
    bytes_acked: u64,
    digest: Option<String>,
    task_id: Option<String>,
    artifact: Option<Artifact>,
    /// Token of the current upload run; replaced on every resume.
    run: CancellationToken,
    error: Option<String>,
}

impl State {
    fn done_count(&self) -> u32 {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Done)
            .count() as u32
    }

    fn done_indices(&self) -> Vec<u32> {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Done)
            .map(|c| c.descriptor.index)
            .collect()
    }

    fn all_done(&self) -> bool {
        self.chunks.iter().all(|c| c.status == ChunkStatus::Done)
    }

    /// Aligns the chunk table with the receiver's view: exactly the
    /// indices in `missing` are left to send.
    fn reconcile(&mut self, missing: &BTreeSet<u32>) {
        self.pending.clear();
        for chunk in &mut self.chunks {
            let index = chunk.descriptor.index;
            let size = u64::from(chunk.descriptor.size);
            if missing.contains(&index) {
                if chunk.status == ChunkStatus::Done {
                    self.bytes_acked -= size;
                }
                chunk.status = ChunkStatus::Pending;
                self.pending.insert(index);
            } else if chunk.status != ChunkStatus::Done {
                chunk.status = ChunkStatus::Done;
                chunk.last_error = None;
                self.bytes_acked += size;
            }
        }
    }

    /// Returns every chunk that is not done to the pending set.
    fn revert_unfinished(&mut self) {
        for chunk in &mut self.chunks {
            if matches!(chunk.status, ChunkStatus::InFlight | ChunkStatus::Failed) {
                chunk.status = ChunkStatus::Pending;
                self.pending.insert(chunk.descriptor.index);
            }
        }
    }

    fn task_id(&self, action: &'static str) -> Result<String, SessionError> {
        self.task_id.clone().ok_or(SessionError::InvalidState {
            action,
            status: self.status,
        })
    }
}

struct Inner {
    path: PathBuf,
    name: String,
    file_size: u64,
    resume_key: String,
    config: SessionConfig,
    transport: Arc<dyn UploadTransport>,
    store: Option<Arc<dyn SessionStore>>,
    state: Mutex<State>,
    events: broadcast::Sender<SessionEvent>,
    speed: SpeedCalculator,
    /// Session-wide token; fired only by cancel.
    cancel: CancellationToken,
    created_at: DateTime<Utc>,
}

enum Dispatch {
    AllDone,
    Interrupted,
}

enum Finalized {
    Completed,
    /// The receiver reported missing chunks; they were re-queued.
    Missing(TransportError),
}

enum AttemptError {
    /// The chunk could not be read from the source file.
    Local(TransferError),
    Remote(TransportError),
}

/// Builder for [`TransferSession`].
pub struct SessionBuilder {
    path: PathBuf,
    transport: Arc<dyn UploadTransport>,
    config: SessionConfig,
    store: Option<Arc<dyn SessionStore>>,
    name: Option<String>,
}

impl SessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Attaches a resume store.
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Overrides the artifact name (defaults to the file name).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Inspects the file and partitions it into chunks.
    pub async fn open(self) -> Result<TransferSession, SessionError> {
        self.config.validate()?;

        let metadata = tokio::fs::metadata(&self.path).await?;
        if !metadata.is_file() {
            return Err(SessionError::InvalidConfig(format!(
                "{} is not a regular file",
                self.path.display()
            )));
        }

        let name = match self.name {
            Some(name) => name,
            None => self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    SessionError::InvalidConfig(format!(
                        "cannot derive a name from {}",
                        self.path.display()
                    ))
                })?,
        };
        validate_artifact_name(&name)?;

        let file_size = metadata.len();
        let chunks: Vec<ChunkState> = partition(file_size, self.config.chunk_size)?
            .into_iter()
            .map(ChunkState::new)
            .collect();

        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        let canonical = tokio::fs::canonicalize(&self.path)
            .await
            .unwrap_or_else(|_| self.path.clone());
        let resume_key = format!("{}:{}:{}", canonical.display(), file_size, modified);

        debug!(
            file = %self.path.display(),
            size = file_size,
            chunks = chunks.len(),
            "opened transfer session"
        );

        let cancel = CancellationToken::new();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = State {
            status: SessionStatus::Idle,
            pending: (0..chunks.len() as u32).collect(),
            chunks,
            bytes_acked: 0,
            digest: None,
            task_id: None,
            artifact: None,
            run: cancel.child_token(),
            error: None,
        };

        Ok(TransferSession {
            inner: Arc::new(Inner {
                path: self.path,
                name,
                file_size,
                resume_key,
                config: self.config,
                transport: self.transport,
                store: self.store,
                state: Mutex::new(state),
                events,
                speed: SpeedCalculator::default(),
                cancel,
                created_at: Utc::now(),
            }),
        })
    }
}

/// Uploads one file to a coordinator.
///
/// Cheap to clone; clones control the same session, so one task can run
/// [`start`](Self::start) while another calls [`pause`](Self::pause) or
/// [`cancel`](Self::cancel).
#[derive(Clone)]
pub struct TransferSession {
    inner: Arc<Inner>,
}

impl TransferSession {
    pub fn builder(path: impl Into<PathBuf>, transport: Arc<dyn UploadTransport>) -> SessionBuilder {
        SessionBuilder {
            path: path.into(),
            transport,
            config: SessionConfig::default(),
            store: None,
            name: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.state().status
    }

    pub fn progress(&self) -> ProgressSnapshot {
        let loaded = self.state().bytes_acked;
        ProgressSnapshot::project(
            loaded,
            self.inner.file_size,
            self.inner.speed.bytes_per_second(),
        )
    }

    /// Snapshot of the chunk table.
    pub fn chunks(&self) -> Vec<ChunkState> {
        self.state().chunks.clone()
    }

    pub fn bytes_acked(&self) -> u64 {
        self.state().bytes_acked
    }

    pub fn task_id(&self) -> Option<String> {
        self.state().task_id.clone()
    }

    pub fn digest(&self) -> Option<String> {
        self.state().digest.clone()
    }

    pub fn artifact(&self) -> Option<Artifact> {
        self.state().artifact.clone()
    }

    /// Message of the failure that ended the session, if any.
    pub fn last_error(&self) -> Option<String> {
        self.state().error.clone()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn file_size(&self) -> u64 {
        self.inner.file_size
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Runs the session until it completes, pauses, is cancelled or fails.
    ///
    /// Returns the status the session settled in. Pause and cancel are not
    /// errors; a paused session continues with [`resume`](Self::resume).
    pub async fn start(&self) -> Result<SessionStatus, SessionError> {
        {
            let mut st = self.state();
            if st.status != SessionStatus::Idle {
                return Err(SessionError::InvalidState {
                    action: "start",
                    status: st.status,
                });
            }
            st.status = if self.inner.config.needs_digest() {
                SessionStatus::Digesting
            } else {
                SessionStatus::CheckingExisting
            };
        }
        info!(file = %self.inner.name, size = self.inner.file_size, "transfer session started");

        let result = match self.prepare().await {
            Ok(true) => self.drive().await,
            Ok(false) => Ok(SessionStatus::Completed),
            Err(e) => Err(e),
        };
        self.settle(result)
    }

    /// Stops dispatch and aborts in-flight chunks, which return to pending.
    ///
    /// Only acts while uploading; otherwise returns the current status.
    pub fn pause(&self) -> SessionStatus {
        {
            let mut st = self.state();
            if st.status != SessionStatus::Uploading {
                return st.status;
            }
            st.status = SessionStatus::Paused;
            st.run.cancel();
            st.revert_unfinished();
        }
        info!(file = %self.inner.name, "transfer session paused");
        self.emit(SessionEvent::Paused);
        self.save_record();
        SessionStatus::Paused
    }

    /// Restarts dispatch from the pending set after reconciling with the
    /// coordinator. Only acts while paused.
    pub async fn resume(&self) -> Result<SessionStatus, SessionError> {
        let (run, req) = {
            let mut st = self.state();
            if st.status != SessionStatus::Paused {
                return Ok(st.status);
            }
            let task_id = st.task_id("resume")?;
            st.status = SessionStatus::Uploading;
            st.run = self.inner.cancel.child_token();
            let req = ListMissingRequest {
                task_id,
                chunk_count: st.chunks.len() as u32,
            };
            (st.run.clone(), req)
        };
        info!(file = %self.inner.name, "transfer session resumed");
        self.emit(SessionEvent::Resumed);

        let result = match self.reconcile_remote(&run, req).await {
            Ok(()) => self.drive().await,
            Err(e) => Err(e),
        };
        self.settle(result)
    }

    /// Aborts the session and asks the coordinator to discard its task.
    ///
    /// The discard is best-effort; the coordinator's expiry sweep reclaims
    /// the task if the request is lost.
    pub async fn cancel(&self) -> SessionStatus {
        let task_id = {
            let mut st = self.state();
            if matches!(st.status, SessionStatus::Completed | SessionStatus::Cancelled) {
                return st.status;
            }
            st.status = SessionStatus::Cancelled;
            st.run.cancel();
            st.revert_unfinished();
            st.task_id.clone()
        };
        self.inner.cancel.cancel();
        info!(file = %self.inner.name, "transfer session cancelled");
        self.emit(SessionEvent::Cancelled);
        self.remove_record();

        if let Some(task_id) = task_id {
            let req = DeleteTaskRequest {
                task_id: task_id.clone(),
            };
            match tokio::time::timeout(REQUEST_TIMEOUT, self.inner.transport.delete_task(req)).await {
                Ok(Ok(_)) => debug!(task_id = %task_id, "coordinator task discarded"),
                Ok(Err(e)) => {
                    warn!(task_id = %task_id, error = %e, "failed to discard coordinator task")
                }
                Err(_) => warn!(task_id = %task_id, "timed out discarding coordinator task"),
            }
        }
        SessionStatus::Cancelled
    }

    /// Digest, instant-upload check and task initialization.
    ///
    /// Returns `false` when the receiver already holds the content.
    async fn prepare(&self) -> Result<bool, SessionError> {
        let inner = &self.inner;
        let record = self.load_record();

        let digest = if inner.config.needs_digest() {
            let digest = self.compute_digest().await?;
            self.advance(SessionStatus::CheckingExisting)?;
            Some(digest)
        } else {
            None
        };
        self.state().digest = digest.clone();

        if inner.config.enable_instant_upload
            && let Some(digest) = &digest
        {
            let req = CheckExistingRequest {
                digest: digest.clone(),
                name: inner.name.clone(),
                size: inner.file_size,
            };
            match cancellable(&inner.cancel, inner.transport.check_existing(req)).await? {
                Ok(resp) if resp.exists => {
                    self.complete_instant(resp.location)?;
                    return Ok(false);
                }
                Ok(_) => debug!(digest = %digest, "content not present on coordinator"),
                Err(e) => warn!(error = %e, "existence check failed, uploading normally"),
            }
        }

        let token = match (&digest, &record) {
            (None, Some(record)) => Some(record.task_id.clone()),
            _ => None,
        };
        let chunk_count = self.state().chunks.len() as u32;
        let req = InitializeTaskRequest {
            digest,
            token,
            name: inner.name.clone(),
            size: inner.file_size,
            chunk_size: inner.config.chunk_size,
            chunk_count,
        };
        let resp = self
            .with_retry("initialize", &inner.cancel, || {
                inner.transport.initialize(req.clone())
            })
            .await?;

        let missing: BTreeSet<u32> = resp.missing_indices.iter().copied().collect();
        {
            let mut st = self.state();
            if st.status == SessionStatus::Cancelled {
                return Err(SessionError::Cancelled);
            }
            st.task_id = Some(resp.task_id.clone());
            st.reconcile(&missing);
            st.status = SessionStatus::Uploading;
            st.run = inner.cancel.child_token();
        }
        info!(
            task_id = %resp.task_id,
            resumed = resp.resumed,
            missing = missing.len(),
            chunks = chunk_count,
            "upload task ready"
        );
        self.save_record();
        self.emit_progress();
        Ok(true)
    }

    async fn compute_digest(&self) -> Result<String, SessionError> {
        let inner = &self.inner;
        debug!(
            file = %inner.name,
            algorithm = ?inner.config.digest_algorithm,
            "computing content digest"
        );
        let digester = Digester::new(inner.config.digest_algorithm)
            .with_window(inner.config.digest_window)
            .with_cancel(inner.cancel.clone());
        let digest = digester
            .digest_file(&inner.path, |processed, total| {
                self.emit(SessionEvent::Digesting { processed, total })
            })
            .await?;
        debug!(digest = %digest, "content digest computed");
        Ok(digest)
    }

    /// Uploads pending chunks and finalizes, re-sending anything the
    /// receiver reports missing at finalize time.
    async fn drive(&self) -> Result<SessionStatus, SessionError> {
        let mut rounds = 0u32;
        loop {
            let run = {
                let st = self.state();
                if st.status != SessionStatus::Uploading {
                    return Ok(st.status);
                }
                st.run.clone()
            };

            if let Dispatch::Interrupted = self.dispatch(&run).await? {
                return Ok(self.status());
            }

            match self.finalize(&run).await? {
                Finalized::Completed => return Ok(SessionStatus::Completed),
                Finalized::Missing(e) => {
                    rounds += 1;
                    if rounds > self.inner.config.max_retries {
                        return Err(e.into());
                    }
                    warn!(round = rounds, "coordinator reported missing chunks, re-sending");
                }
            }
        }
    }

    async fn dispatch(&self, run: &CancellationToken) -> Result<Dispatch, SessionError> {
        let max_concurrent = self.inner.config.max_concurrent;
        let mut in_flight = FuturesUnordered::new();
        let mut backoff = FuturesUnordered::new();

        loop {
            while in_flight.len() < max_concurrent {
                let Some((task_id, chunk)) = self.claim_next(run) else {
                    break;
                };
                in_flight.push(self.transmit(task_id, chunk));
            }

            if in_flight.is_empty() && backoff.is_empty() {
                let done = self.state().all_done();
                return Ok(if done && !run.is_cancelled() {
                    Dispatch::AllDone
                } else {
                    Dispatch::Interrupted
                });
            }

            tokio::select! {
                biased;
                _ = run.cancelled() => return Ok(Dispatch::Interrupted),
                Some((index, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    match result {
                        Ok(()) => self.on_chunk_sent(run, index),
                        Err(err) => {
                            if let Some(delay) = self.on_chunk_failed(run, index, err)? {
                                backoff.push(wait_then(index, delay));
                            }
                        }
                    }
                }
                Some(index) = backoff.next(), if !backoff.is_empty() => self.requeue(run, index),
            }
        }
    }

    /// Claims the lowest pending index for transmission.
    fn claim_next(&self, run: &CancellationToken) -> Option<(String, ChunkDescriptor)> {
        let mut st = self.state();
        if run.is_cancelled() || st.status != SessionStatus::Uploading {
            return None;
        }
        let task_id = st.task_id.clone()?;
        let index = st.pending.pop_first()?;
        let chunk = &mut st.chunks[index as usize];
        chunk.status = ChunkStatus::InFlight;
        debug!(index, attempt = chunk.retry_count + 1, "dispatching chunk");
        Some((task_id, chunk.descriptor))
    }

    async fn transmit(
        &self,
        task_id: String,
        chunk: ChunkDescriptor,
    ) -> (u32, Result<(), AttemptError>) {
        (chunk.index, self.send_chunk(task_id, &chunk).await)
    }

    async fn send_chunk(&self, task_id: String, chunk: &ChunkDescriptor) -> Result<(), AttemptError> {
        let inner = &self.inner;
        let data = read_chunk(&inner.path, chunk)
            .await
            .map_err(AttemptError::Local)?;
        let chunk_digest = inner
            .config
            .verify_chunk_digest
            .then(|| checksum_bytes(inner.config.digest_algorithm, &data));
        let req = SendChunkRequest {
            task_id,
            index: chunk.index,
            chunk_digest,
        };

        let resp = tokio::time::timeout(inner.config.chunk_timeout, inner.transport.send_chunk(req, data))
            .await
            .map_err(|_| AttemptError::Remote(TransportError::Timeout))?
            .map_err(AttemptError::Remote)?;
        if !resp.ok || resp.index != chunk.index {
            return Err(AttemptError::Remote(TransportError::Protocol(format!(
                "unexpected acknowledgement for chunk {}: ok={} index={}",
                chunk.index, resp.ok, resp.index
            ))));
        }
        Ok(())
    }

    fn on_chunk_sent(&self, run: &CancellationToken, index: u32) {
        let (size, completed, total) = {
            let mut st = self.state();
            if run.is_cancelled() {
                return;
            }
            let chunk = &mut st.chunks[index as usize];
            if chunk.status != ChunkStatus::InFlight {
                return;
            }
            chunk.status = ChunkStatus::Done;
            chunk.last_error = None;
            let size = u64::from(chunk.descriptor.size);
            st.bytes_acked += size;
            (size, st.done_count(), st.chunks.len() as u32)
        };

        debug!(index, completed, total, "chunk acknowledged");
        self.inner.speed.add_sample(size);
        self.emit(SessionEvent::ChunkComplete {
            index,
            completed,
            total,
        });
        self.emit_progress();
        self.save_record();
    }

    /// Records a failed attempt. Returns the backoff delay when the chunk
    /// will be retried.
    fn on_chunk_failed(
        &self,
        run: &CancellationToken,
        index: u32,
        err: AttemptError,
    ) -> Result<Option<Duration>, SessionError> {
        let mut st = self.state();
        if run.is_cancelled() {
            return Ok(None);
        }
        let chunk = &mut st.chunks[index as usize];
        chunk.status = ChunkStatus::Failed;

        match err {
            AttemptError::Local(e) => {
                chunk.last_error = Some(e.to_string());
                Err(e.into())
            }
            AttemptError::Remote(e) => {
                chunk.retry_count += 1;
                chunk.last_error = Some(e.to_string());
                let retries = chunk.retry_count;
                match self.inner.config.retry_policy().decide(e.class(), retries) {
                    RetryDecision::Retry(delay) => {
                        warn!(index, attempt = retries, error = %e, ?delay, "chunk failed, retrying");
                        Ok(Some(delay))
                    }
                    RetryDecision::GiveUp => Err(SessionError::ChunkFailed {
                        index,
                        retries,
                        source: e,
                    }),
                }
            }
        }
    }

    fn requeue(&self, run: &CancellationToken, index: u32) {
        let mut st = self.state();
        if run.is_cancelled() {
            return;
        }
        if st.chunks[index as usize].status == ChunkStatus::Failed {
            st.chunks[index as usize].status = ChunkStatus::Pending;
            st.pending.insert(index);
        }
    }

    async fn finalize(&self, run: &CancellationToken) -> Result<Finalized, SessionError> {
        let req = {
            let st = self.state();
            FinalizeRequest {
                task_id: st.task_id("finalize")?,
                digest: st.digest.clone(),
                size: self.inner.file_size,
                name: self.inner.name.clone(),
            }
        };
        info!(task_id = %req.task_id, "all chunks acknowledged, finalizing");

        let result = self
            .with_retry("finalize", run, || self.inner.transport.finalize(req.clone()))
            .await;
        match result {
            Ok(resp) => {
                self.complete(resp)?;
                Ok(Finalized::Completed)
            }
            Err(SessionError::Transport(e)) if e.kind() == ErrorKind::IncompleteTask => {
                let missing = e
                    .remote()
                    .map(|w| w.missing_indices().to_vec())
                    .unwrap_or_default();
                self.requeue_missing(run, &missing);
                Ok(Finalized::Missing(e))
            }
            Err(e) => Err(e),
        }
    }

    fn requeue_missing(&self, run: &CancellationToken, missing: &[u32]) {
        let mut st = self.state();
        if run.is_cancelled() {
            return;
        }
        for &index in missing {
            let Some(chunk) = st.chunks.get_mut(index as usize) else {
                continue;
            };
            if chunk.status == ChunkStatus::Done {
                chunk.status = ChunkStatus::Pending;
                let size = u64::from(chunk.descriptor.size);
                st.bytes_acked -= size;
                st.pending.insert(index);
            }
        }
    }

    async fn reconcile_remote(
        &self,
        run: &CancellationToken,
        req: ListMissingRequest,
    ) -> Result<(), SessionError> {
        match cancellable(run, self.inner.transport.list_missing(req)).await? {
            Ok(resp) => {
                let missing: BTreeSet<u32> = resp.missing_indices.into_iter().collect();
                {
                    let mut st = self.state();
                    if run.is_cancelled() {
                        return Err(SessionError::Cancelled);
                    }
                    st.reconcile(&missing);
                }
                debug!(missing = missing.len(), "reconciled with coordinator");
                self.emit_progress();
                Ok(())
            }
            Err(e) if e.class() == ErrorClass::Protocol => Err(e.into()),
            Err(e) => {
                warn!(error = %e, "could not reconcile with coordinator, using local chunk state");
                Ok(())
            }
        }
    }

    fn complete(&self, resp: FinalizeResponse) -> Result<(), SessionError> {
        {
            let mut st = self.state();
            if st.status == SessionStatus::Cancelled {
                return Err(SessionError::Cancelled);
            }
            st.status = SessionStatus::Completed;
            st.artifact = Some(Artifact {
                location: resp.artifact_location.clone(),
                size: resp.final_size,
                instant: false,
            });
        }
        info!(
            location = %resp.artifact_location,
            size = resp.final_size,
            "transfer completed"
        );
        self.remove_record();
        self.emit(SessionEvent::Success {
            location: resp.artifact_location,
            size: resp.final_size,
            instant: false,
        });
        Ok(())
    }

    fn complete_instant(&self, location: Option<String>) -> Result<(), SessionError> {
        let location = location.unwrap_or_else(|| self.inner.name.clone());
        let size = self.inner.file_size;
        {
            let mut st = self.state();
            if st.status == SessionStatus::Cancelled {
                return Err(SessionError::Cancelled);
            }
            for chunk in &mut st.chunks {
                chunk.status = ChunkStatus::Done;
            }
            st.pending.clear();
            st.bytes_acked = size;
            st.status = SessionStatus::Completed;
            st.artifact = Some(Artifact {
                location: location.clone(),
                size,
                instant: true,
            });
        }
        info!(location = %location, "content already present, instant upload");
        self.remove_record();
        self.emit_progress();
        self.emit(SessionEvent::Success {
            location,
            size,
            instant: true,
        });
        Ok(())
    }

    /// Maps the outcome of a run to the caller's result.
    fn settle(&self, result: Result<SessionStatus, SessionError>) -> Result<SessionStatus, SessionError> {
        match result {
            Ok(status) => Ok(status),
            Err(e) if e.is_cancellation() => Ok(self.status()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&self, e: SessionError) -> SessionError {
        {
            let mut st = self.state();
            if matches!(st.status, SessionStatus::Failed | SessionStatus::Cancelled) {
                return e;
            }
            st.status = SessionStatus::Failed;
            st.error = Some(e.to_string());
            st.run.cancel();
        }
        error!(file = %self.inner.name, error = %e, "transfer session failed");
        self.save_record();
        self.emit(SessionEvent::Error {
            kind: e.kind(),
            message: e.to_string(),
        });
        e
    }

    fn advance(&self, to: SessionStatus) -> Result<(), SessionError> {
        let mut st = self.state();
        if st.status == SessionStatus::Cancelled {
            return Err(SessionError::Cancelled);
        }
        debug!(from = ?st.status, to = ?to, "session state change");
        st.status = to;
        Ok(())
    }

    /// Runs a request, retrying transient and capacity failures with
    /// backoff. Integrity and protocol failures are returned at once.
    async fn with_retry<T, F, Fut>(
        &self,
        op: &'static str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, SessionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let policy = self.inner.config.retry_policy();
        let mut retries = 0u32;
        loop {
            let err = match cancellable(cancel, call()).await? {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            retries += 1;
            if err.class() == ErrorClass::Integrity {
                return Err(err.into());
            }
            match policy.decide(err.class(), retries) {
                RetryDecision::Retry(delay) => {
                    warn!(op, attempt = retries, error = %err, ?delay, "request failed, retrying");
                    cancellable(cancel, tokio::time::sleep(delay)).await?;
                }
                RetryDecision::GiveUp => return Err(err.into()),
            }
        }
    }

    fn load_record(&self) -> Option<ResumeRecord> {
        let inner = &self.inner;
        let store = inner.store.as_ref()?;
        match store.load(&inner.resume_key) {
            Ok(Some(record))
                if record.file_size == inner.file_size
                    && record.chunk_size == inner.config.chunk_size
                    && record.name == inner.name =>
            {
                debug!(task_id = %record.task_id, "found resume record");
                Some(record)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "failed to load resume record");
                None
            }
        }
    }

    fn save_record(&self) {
        let inner = &self.inner;
        let Some(store) = &inner.store else {
            return;
        };
        let record = {
            let st = self.state();
            let Some(task_id) = st.task_id.clone() else {
                return;
            };
            if matches!(st.status, SessionStatus::Completed | SessionStatus::Cancelled) {
                return;
            }
            ResumeRecord {
                task_id,
                digest: st.digest.clone(),
                chunk_size: inner.config.chunk_size,
                file_size: inner.file_size,
                name: inner.name.clone(),
                done_indices: st.done_indices(),
                updated_at: Utc::now(),
            }
        };
        if let Err(e) = store.save(&inner.resume_key, &record) {
            warn!(error = %e, "failed to save resume record");
        }
    }

    fn remove_record(&self) {
        if let Some(store) = &self.inner.store
            && let Err(e) = store.remove(&self.inner.resume_key)
        {
            warn!(error = %e, "failed to remove resume record");
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn emit_progress(&self) {
        self.emit(SessionEvent::Progress(self.progress()));
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, SessionError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        out = fut => Ok(out),
    }
}

async fn wait_then(index: u32, delay: Duration) -> u32 {
    tokio::time::sleep(delay).await;
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;

    use chunkup_protocol::messages::{
        CheckExistingResponse, DeleteTaskResponse, InitializeTaskResponse, ListMissingResponse,
        SendChunkResponse, TaskStatusRequest, TaskStatusResponse,
    };
    use chunkup_protocol::{ErrorDetails, WireError};
    use tokio::sync::Notify;

    use crate::store::MemoryStore;
    use crate::transport::TransportFuture;

    const MIB: u64 = 1024 * 1024;

    /// Scriptable in-memory coordinator.
    #[derive(Default)]
    struct MockTransport {
        exists: bool,
        /// Errors returned by successive attempts of a chunk index.
        failures: Mutex<HashMap<u32, VecDeque<TransportError>>>,
        /// Indices whose next attempt never completes.
        hang: Mutex<HashSet<u32>>,
        entered: Notify,
        /// Missing-index lists returned by successive finalize calls.
        finalize_missing: Mutex<VecDeque<Vec<u32>>>,
        received: Mutex<HashMap<u32, usize>>,
        attempts: Mutex<Vec<u32>>,
        attempt_times: Mutex<Vec<tokio::time::Instant>>,
        successes: Mutex<Vec<u32>>,
        chunk_digests: Mutex<Vec<Option<String>>>,
        init_requests: Mutex<Vec<InitializeTaskRequest>>,
        deleted: Mutex<Vec<String>>,
        finalize_calls: Mutex<u32>,
    }

    impl MockTransport {
        fn fail(&self, index: u32, errors: Vec<TransportError>) {
            self.failures
                .lock()
                .unwrap()
                .insert(index, errors.into_iter().collect());
        }

        fn hang_next(&self, index: u32) {
            self.hang.lock().unwrap().insert(index);
        }

        fn attempts_for(&self, index: u32) -> usize {
            self.attempts
                .lock()
                .unwrap()
                .iter()
                .filter(|&&i| i == index)
                .count()
        }

        fn successes_for(&self, index: u32) -> usize {
            self.successes
                .lock()
                .unwrap()
                .iter()
                .filter(|&&i| i == index)
                .count()
        }

        fn missing(&self, chunk_count: u32) -> Vec<u32> {
            let received = self.received.lock().unwrap();
            (0..chunk_count).filter(|i| !received.contains_key(i)).collect()
        }
    }

    impl UploadTransport for MockTransport {
        fn check_existing(
            &self,
            req: CheckExistingRequest,
        ) -> TransportFuture<'_, CheckExistingResponse> {
            Box::pin(async move {
                Ok(CheckExistingResponse {
                    exists: self.exists,
                    location: self.exists.then(|| format!("mem://{}", req.name)),
                })
            })
        }

        fn initialize(
            &self,
            req: InitializeTaskRequest,
        ) -> TransportFuture<'_, InitializeTaskResponse> {
            Box::pin(async move {
                let missing = self.missing(req.chunk_count);
                let resumed = missing.len() < req.chunk_count as usize;
                self.init_requests.lock().unwrap().push(req);
                Ok(InitializeTaskResponse {
                    task_id: "task-1".into(),
                    missing_indices: missing,
                    resumed,
                })
            })
        }

        fn send_chunk(
            &self,
            req: SendChunkRequest,
            data: Vec<u8>,
        ) -> TransportFuture<'_, SendChunkResponse> {
            Box::pin(async move {
                let index = req.index;
                self.attempts.lock().unwrap().push(index);
                self.attempt_times
                    .lock()
                    .unwrap()
                    .push(tokio::time::Instant::now());
                if self.hang.lock().unwrap().remove(&index) {
                    self.entered.notify_one();
                    std::future::pending::<()>().await;
                }
                let scripted = self
                    .failures
                    .lock()
                    .unwrap()
                    .get_mut(&index)
                    .and_then(VecDeque::pop_front);
                if let Some(err) = scripted {
                    return Err(err);
                }
                self.chunk_digests.lock().unwrap().push(req.chunk_digest);
                self.received.lock().unwrap().insert(index, data.len());
                self.successes.lock().unwrap().push(index);
                Ok(SendChunkResponse { ok: true, index })
            })
        }

        fn list_missing(&self, req: ListMissingRequest) -> TransportFuture<'_, ListMissingResponse> {
            Box::pin(async move {
                Ok(ListMissingResponse {
                    missing_indices: self.missing(req.chunk_count),
                })
            })
        }

        fn finalize(&self, req: FinalizeRequest) -> TransportFuture<'_, FinalizeResponse> {
            Box::pin(async move {
                *self.finalize_calls.lock().unwrap() += 1;
                if let Some(missing) = self.finalize_missing.lock().unwrap().pop_front() {
                    for index in &missing {
                        self.received.lock().unwrap().remove(index);
                    }
                    return Err(WireError::new(409, ErrorKind::IncompleteTask, "chunks missing")
                        .with_details(ErrorDetails::missing(missing))
                        .into());
                }
                Ok(FinalizeResponse {
                    artifact_location: format!("mem://{}", req.name),
                    final_size: req.size,
                })
            })
        }

        fn delete_task(&self, req: DeleteTaskRequest) -> TransportFuture<'_, DeleteTaskResponse> {
            Box::pin(async move {
                self.deleted.lock().unwrap().push(req.task_id);
                Ok(DeleteTaskResponse { ok: true })
            })
        }

        fn task_status(&self, req: TaskStatusRequest) -> TransportFuture<'_, TaskStatusResponse> {
            Box::pin(async move {
                Err(WireError::new(404, ErrorKind::UnknownTask, format!("unknown task {}", req.task_id))
                    .into())
            })
        }
    }

    fn write_file(dir: &tempfile::TempDir, len: usize) -> PathBuf {
        let path = dir.path().join("payload.bin");
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    fn fast_config(chunk_size: u32) -> SessionConfig {
        SessionConfig {
            chunk_size,
            retry_base_delay: Duration::from_millis(5),
            retry_max_delay: Duration::from_millis(20),
            ..Default::default()
        }
    }

    async fn open(
        path: &PathBuf,
        mock: &Arc<MockTransport>,
        config: SessionConfig,
    ) -> TransferSession {
        TransferSession::builder(path.clone(), mock.clone() as Arc<dyn UploadTransport>)
            .config(config)
            .open()
            .await
            .unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn instant_upload_sends_no_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 100);
        let mock = Arc::new(MockTransport {
            exists: true,
            ..Default::default()
        });
        let session = open(&path, &mock, fast_config(30)).await;
        let mut rx = session.subscribe();

        assert_eq!(session.start().await.unwrap(), SessionStatus::Completed);
        assert!(mock.attempts.lock().unwrap().is_empty());
        assert!(mock.init_requests.lock().unwrap().is_empty());
        assert_eq!(session.bytes_acked(), 100);
        assert_eq!(session.progress().percentage, 100.0);

        let artifact = session.artifact().unwrap();
        assert!(artifact.instant);
        assert_eq!(artifact.location, "mem://payload.bin");

        let events = drain(&mut rx);
        assert!(matches!(events.first(), Some(SessionEvent::Digesting { .. })));
        assert!(events.contains(&SessionEvent::Success {
            location: "mem://payload.bin".into(),
            size: 100,
            instant: true,
        }));
    }

    #[tokio::test]
    async fn twelve_mib_with_flaky_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, (12 * MIB) as usize);
        let mock = Arc::new(MockTransport::default());
        mock.fail(
            1,
            vec![
                TransportError::Timeout,
                TransportError::Network("connection reset".into()),
            ],
        );
        let config = SessionConfig {
            max_concurrent: 2,
            ..fast_config((5 * MIB) as u32)
        };
        let session = open(&path, &mock, config).await;

        assert_eq!(session.start().await.unwrap(), SessionStatus::Completed);

        let chunks = session.chunks();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Done));
        assert_eq!(chunks[1].retry_count, 2);
        assert_eq!(chunks[0].retry_count, 0);
        assert_eq!(session.bytes_acked(), 12 * MIB);
        assert_eq!(mock.attempts_for(1), 3);

        let received = mock.received.lock().unwrap();
        assert_eq!(received[&0], (5 * MIB) as usize);
        assert_eq!(received[&1], (5 * MIB) as usize);
        assert_eq!(received[&2], (2 * MIB) as usize);
    }

    #[tokio::test]
    async fn chunks_dispatched_lowest_index_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 50);
        let mock = Arc::new(MockTransport::default());
        let config = SessionConfig {
            max_concurrent: 1,
            enable_instant_upload: false,
            ..fast_config(10)
        };
        let session = open(&path, &mock, config).await;

        session.start().await.unwrap();
        assert_eq!(*mock.attempts.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        // Nothing needs a digest with both features off.
        assert!(session.digest().is_none());
    }

    #[tokio::test]
    async fn pause_then_resume_completes_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 30);
        let mock = Arc::new(MockTransport::default());
        mock.hang_next(1);
        let config = SessionConfig {
            max_concurrent: 1,
            ..fast_config(10)
        };
        let session = open(&path, &mock, config).await;
        let mut rx = session.subscribe();

        let runner = {
            let session = session.clone();
            tokio::spawn(async move { session.start().await })
        };
        mock.entered.notified().await;

        let chunks = session.chunks();
        assert_eq!(chunks[0].status, ChunkStatus::Done);
        assert_eq!(chunks[1].status, ChunkStatus::InFlight);
        assert_eq!(chunks[2].status, ChunkStatus::Pending);

        assert_eq!(session.pause(), SessionStatus::Paused);
        assert_eq!(runner.await.unwrap().unwrap(), SessionStatus::Paused);
        assert_eq!(session.chunks()[1].status, ChunkStatus::Pending);
        assert_eq!(session.bytes_acked(), 10);

        // Pausing twice is a no-op.
        assert_eq!(session.pause(), SessionStatus::Paused);

        assert_eq!(session.resume().await.unwrap(), SessionStatus::Completed);
        assert_eq!(session.bytes_acked(), 30);
        for index in 0..3 {
            assert_eq!(mock.successes_for(index), 1, "chunk {index}");
        }
        assert_eq!(mock.attempts_for(1), 2);

        let events = drain(&mut rx);
        let paused = events.iter().position(|e| *e == SessionEvent::Paused).unwrap();
        let resumed = events.iter().position(|e| *e == SessionEvent::Resumed).unwrap();
        assert!(paused < resumed);
    }

    #[tokio::test]
    async fn cancel_discards_coordinator_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 30);
        let mock = Arc::new(MockTransport::default());
        mock.hang_next(0);
        let session = open(&path, &mock, fast_config(10)).await;

        let runner = {
            let session = session.clone();
            tokio::spawn(async move { session.start().await })
        };
        mock.entered.notified().await;

        assert_eq!(session.cancel().await, SessionStatus::Cancelled);
        assert_eq!(runner.await.unwrap().unwrap(), SessionStatus::Cancelled);
        assert_eq!(*mock.deleted.lock().unwrap(), vec!["task-1".to_string()]);
        assert_eq!(*mock.finalize_calls.lock().unwrap(), 0);

        // Terminal: resume and pause do nothing, a second cancel is a no-op.
        assert_eq!(session.resume().await.unwrap(), SessionStatus::Cancelled);
        assert_eq!(session.cancel().await, SessionStatus::Cancelled);
        assert_eq!(mock.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn protocol_error_fails_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 30);
        let mock = Arc::new(MockTransport::default());
        mock.fail(
            0,
            vec![WireError::new(404, ErrorKind::UnknownTask, "unknown task task-1").into()],
        );
        let config = SessionConfig {
            max_concurrent: 1,
            ..fast_config(10)
        };
        let session = open(&path, &mock, config).await;
        let mut rx = session.subscribe();

        let err = session.start().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::ChunkFailed {
                index: 0,
                retries: 1,
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::UnknownTask);
        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(mock.attempts_for(0), 1);
        assert!(session.last_error().is_some());

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Error {
                kind: ErrorKind::UnknownTask,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn retries_exhausted_fails_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 30);
        let mock = Arc::new(MockTransport::default());
        mock.fail(2, vec![TransportError::Timeout; 5]);
        let session = open(&path, &mock, fast_config(10)).await;

        let err = session.start().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::ChunkFailed {
                index: 2,
                retries: 3,
                ..
            }
        ));
        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(mock.attempts_for(2), 3);
        assert_eq!(session.chunks()[2].retry_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_chunk_times_out_and_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 100);
        let mock = Arc::new(MockTransport::default());
        mock.hang_next(0);
        let config = SessionConfig {
            chunk_timeout: Duration::from_millis(20),
            enable_instant_upload: false,
            ..fast_config(100)
        };
        let session = open(&path, &mock, config).await;

        assert_eq!(session.start().await.unwrap(), SessionStatus::Completed);
        assert_eq!(mock.attempts_for(0), 2);
        assert_eq!(mock.successes_for(0), 1);
        let chunk = &session.chunks()[0];
        assert_eq!(chunk.retry_count, 1);
        assert_eq!(chunk.status, ChunkStatus::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_back_off_exponentially() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 100);
        let mock = Arc::new(MockTransport::default());
        mock.fail(
            0,
            vec![
                TransportError::Network("reset".into()),
                TransportError::Network("reset".into()),
            ],
        );
        let config = SessionConfig {
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(10),
            enable_instant_upload: false,
            ..fast_config(100)
        };
        let session = open(&path, &mock, config).await;

        assert_eq!(session.start().await.unwrap(), SessionStatus::Completed);
        let times = mock.attempt_times.lock().unwrap().clone();
        assert_eq!(times.len(), 3);
        let tolerance = Duration::from_millis(5);
        for (gap, expected) in times
            .windows(2)
            .map(|w| w[1] - w[0])
            .zip([Duration::from_millis(100), Duration::from_millis(200)])
        {
            assert!(gap >= expected, "gap {gap:?} shorter than {expected:?}");
            assert!(gap < expected + tolerance, "gap {gap:?} longer than {expected:?}");
        }
    }

    #[tokio::test]
    async fn chunk_digest_mismatch_is_resent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 30);
        let mock = Arc::new(MockTransport::default());
        mock.fail(
            1,
            vec![WireError::new(422, ErrorKind::ChunkDigestMismatch, "digest mismatch").into()],
        );
        let config = SessionConfig {
            verify_chunk_digest: true,
            ..fast_config(10)
        };
        let session = open(&path, &mock, config).await;

        assert_eq!(session.start().await.unwrap(), SessionStatus::Completed);
        assert_eq!(session.chunks()[1].retry_count, 1);
        let digests = mock.chunk_digests.lock().unwrap();
        assert_eq!(digests.len(), 3);
        assert!(digests.iter().all(|d| d.as_ref().is_some_and(|d| d.len() == 32)));
    }

    #[tokio::test]
    async fn incomplete_finalize_resends_missing_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 30);
        let mock = Arc::new(MockTransport::default());
        mock.finalize_missing.lock().unwrap().push_back(vec![1]);
        let session = open(&path, &mock, fast_config(10)).await;

        assert_eq!(session.start().await.unwrap(), SessionStatus::Completed);
        assert_eq!(mock.successes_for(1), 2);
        assert_eq!(mock.successes_for(0), 1);
        assert_eq!(*mock.finalize_calls.lock().unwrap(), 2);
        assert_eq!(session.bytes_acked(), 30);
    }

    #[tokio::test]
    async fn resume_record_reuses_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 30);
        let mock = Arc::new(MockTransport::default());
        let store = Arc::new(MemoryStore::new());
        mock.fail(
            2,
            vec![WireError::new(400, ErrorKind::InvalidRequest, "rejected").into()],
        );
        let config = SessionConfig {
            max_concurrent: 1,
            enable_instant_upload: false,
            ..fast_config(10)
        };

        let first = TransferSession::builder(path.clone(), mock.clone() as Arc<dyn UploadTransport>)
            .config(config.clone())
            .store(store.clone() as Arc<dyn SessionStore>)
            .open()
            .await
            .unwrap();
        assert!(first.start().await.is_err());
        assert_eq!(store.len(), 1);

        let second = TransferSession::builder(path.clone(), mock.clone() as Arc<dyn UploadTransport>)
            .config(config)
            .store(store.clone() as Arc<dyn SessionStore>)
            .open()
            .await
            .unwrap();
        assert_eq!(second.start().await.unwrap(), SessionStatus::Completed);

        let inits = mock.init_requests.lock().unwrap();
        assert_eq!(inits[0].token, None);
        assert_eq!(inits[1].token.as_deref(), Some("task-1"));
        assert_eq!(mock.successes_for(0), 1);
        assert_eq!(mock.successes_for(1), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn controls_outside_their_states() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 30);
        let mock = Arc::new(MockTransport::default());
        let session = open(&path, &mock, fast_config(10)).await;

        assert_eq!(session.pause(), SessionStatus::Idle);
        assert_eq!(session.resume().await.unwrap(), SessionStatus::Idle);

        session.start().await.unwrap();
        assert!(matches!(
            session.start().await,
            Err(SessionError::InvalidState { action: "start", .. })
        ));
        assert_eq!(session.pause(), SessionStatus::Completed);
        assert_eq!(session.cancel().await, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn open_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 0);
        let mock = Arc::new(MockTransport::default());
        let result = TransferSession::builder(path, mock as Arc<dyn UploadTransport>)
            .open()
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Transfer(TransferError::EmptyFile))
        ));
    }
}
