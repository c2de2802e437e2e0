//! TCP transport (sender side).
//!
//! Each request opens its own connection, writes one frame and reads one
//! response frame. Dropping a request future drops its connection, which
//! is how pause and cancel abort an in-flight chunk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chunkup_protocol::constants::{FINALIZE_TIMEOUT, REQUEST_TIMEOUT};
use chunkup_protocol::messages::{
    CheckExistingRequest, CheckExistingResponse, DeleteTaskRequest, DeleteTaskResponse,
    FinalizeRequest, FinalizeResponse, HealthResponse, InitializeTaskRequest,
    InitializeTaskResponse, ListMissingRequest, ListMissingResponse, SendChunkRequest,
    SendChunkResponse, TaskStatusRequest, TaskStatusResponse,
};
use chunkup_protocol::{Message, MessageType};
use chunkup_session::{TransportError, TransportFuture, UploadTransport};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::DataChannelError;
use crate::wire::{read_frame, write_frame};
use crate::{TCP_BUFFER_SIZE, TCP_CONNECT_TIMEOUT};

/// Talks to a [`CoordinatorServer`](crate::CoordinatorServer) over TCP.
pub struct TcpTransport {
    addr: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    /// Bound on one `send_chunk` exchange. Sessions set this from their
    /// own chunk timeout so the longer of the two is not cut short here.
    chunk_timeout: Duration,
    finalize_timeout: Duration,
    next_id: AtomicU64,
}

impl TcpTransport {
    /// `addr` is a `host:port` string.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: TCP_CONNECT_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            chunk_timeout: REQUEST_TIMEOUT,
            finalize_timeout: FINALIZE_TIMEOUT,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Timeout for a whole exchange, chunk sends and finalize excepted.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    pub fn with_finalize_timeout(mut self, timeout: Duration) -> Self {
        self.finalize_timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn health(&self) -> Result<HealthResponse, TransportError> {
        self.exchange::<(), _>(MessageType::Health, None, Vec::new(), self.request_timeout)
            .await
    }

    async fn exchange<Req, Resp>(
        &self,
        msg_type: MessageType,
        body: Option<&Req>,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Resp, TransportError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let id = format!("req-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = Message::new(id, msg_type, body)
            .map_err(|e| TransportError::Protocol(format!("cannot encode request: {e}")))?;

        let response = match tokio::time::timeout(timeout, self.round_trip(&request, &payload)).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout),
        };

        if response.id != request.id {
            return Err(TransportError::Protocol(format!(
                "response id {} does not match request {}",
                response.id, request.id
            )));
        }
        if response.msg_type == MessageType::Error {
            return Err(match response.error {
                Some(e) => TransportError::Remote(e),
                None => TransportError::Protocol("error frame without error body".into()),
            });
        }
        if Some(response.msg_type) != msg_type.response() {
            return Err(TransportError::Protocol(format!(
                "unexpected response type {:?} to {:?}",
                response.msg_type, msg_type
            )));
        }

        response
            .parse_payload::<Resp>()
            .map_err(|e| TransportError::Protocol(format!("invalid response payload: {e}")))?
            .ok_or_else(|| TransportError::Protocol("response without payload".into()))
    }

    async fn round_trip(&self, request: &Message, payload: &[u8]) -> Result<Message, DataChannelError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| DataChannelError::Timeout)??;
        stream.set_nodelay(true)?;

        let (mut reader, writer) = stream.into_split();
        let mut writer = BufWriter::with_capacity(TCP_BUFFER_SIZE, writer);
        write_frame(&mut writer, request, payload).await?;
        writer.flush().await?;

        let frame = read_frame(&mut reader).await?.ok_or_else(|| {
            DataChannelError::Protocol("connection closed before response".into())
        })?;
        debug!(id = %request.id, kind = ?request.msg_type, "exchange complete");
        Ok(frame.message)
    }
}

impl UploadTransport for TcpTransport {
    fn check_existing(
        &self,
        req: CheckExistingRequest,
    ) -> TransportFuture<'_, CheckExistingResponse> {
        Box::pin(async move {
            self.exchange(MessageType::CheckExisting, Some(&req), Vec::new(), self.request_timeout)
                .await
        })
    }

    fn initialize(
        &self,
        req: InitializeTaskRequest,
    ) -> TransportFuture<'_, InitializeTaskResponse> {
        Box::pin(async move {
            self.exchange(MessageType::InitializeTask, Some(&req), Vec::new(), self.request_timeout)
                .await
        })
    }

    fn send_chunk(
        &self,
        req: SendChunkRequest,
        data: Vec<u8>,
    ) -> TransportFuture<'_, SendChunkResponse> {
        Box::pin(async move {
            self.exchange(MessageType::SendChunk, Some(&req), data, self.chunk_timeout)
                .await
        })
    }

    fn list_missing(&self, req: ListMissingRequest) -> TransportFuture<'_, ListMissingResponse> {
        Box::pin(async move {
            self.exchange(MessageType::ListMissing, Some(&req), Vec::new(), self.request_timeout)
                .await
        })
    }

    fn finalize(&self, req: FinalizeRequest) -> TransportFuture<'_, FinalizeResponse> {
        Box::pin(async move {
            self.exchange(MessageType::Finalize, Some(&req), Vec::new(), self.finalize_timeout)
                .await
        })
    }

    fn delete_task(&self, req: DeleteTaskRequest) -> TransportFuture<'_, DeleteTaskResponse> {
        Box::pin(async move {
            self.exchange(MessageType::DeleteTask, Some(&req), Vec::new(), self.request_timeout)
                .await
        })
    }

    fn task_status(&self, req: TaskStatusRequest) -> TransportFuture<'_, TaskStatusResponse> {
        Box::pin(async move {
            self.exchange(MessageType::TaskStatus, Some(&req), Vec::new(), self.request_timeout)
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chunkup_coordinator::{Coordinator, CoordinatorConfig};
    use chunkup_protocol::ErrorKind;
    use tokio_util::sync::CancellationToken;

    use crate::server::CoordinatorServer;

    async fn start_server(dir: &tempfile::TempDir) -> (String, CancellationToken) {
        let coordinator = Arc::new(
            Coordinator::open(CoordinatorConfig::new(dir.path()))
                .await
                .unwrap(),
        );
        let cancel = CancellationToken::new();
        let listener = CoordinatorServer::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = CoordinatorServer::new(coordinator, cancel.clone());
        tokio::spawn(async move { server.serve(listener).await });
        (addr, cancel)
    }

    #[tokio::test]
    async fn chunk_roundtrip_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, cancel) = start_server(&dir).await;
        let transport = TcpTransport::new(addr);

        let init = transport
            .initialize(InitializeTaskRequest {
                digest: None,
                token: None,
                name: "hello.txt".into(),
                size: 11,
                chunk_size: 6,
                chunk_count: 2,
            })
            .await
            .unwrap();
        assert_eq!(init.missing_indices, vec![0, 1]);

        for (index, data) in [(1u32, b"world".to_vec()), (0, b"hello ".to_vec())] {
            let ack = transport
                .send_chunk(
                    SendChunkRequest {
                        task_id: init.task_id.clone(),
                        index,
                        chunk_digest: None,
                    },
                    data,
                )
                .await
                .unwrap();
            assert_eq!(ack.index, index);
        }

        let done = transport
            .finalize(FinalizeRequest {
                task_id: init.task_id.clone(),
                digest: None,
                size: 11,
                name: "hello.txt".into(),
            })
            .await
            .unwrap();
        assert_eq!(done.final_size, 11);
        assert_eq!(std::fs::read(&done.artifact_location).unwrap(), b"hello world");

        assert_eq!(transport.health().await.unwrap().active_tasks, 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn remote_errors_are_structured() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, cancel) = start_server(&dir).await;
        let transport = TcpTransport::new(addr);

        let err = transport
            .task_status(TaskStatusRequest {
                task_id: "missing".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownTask);
        assert_eq!(err.remote().unwrap().code, 404);
        cancel.cancel();
    }

    /// Accepts connections and never answers.
    async fn silent_listener() -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                open.push(stream);
            }
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn chunk_send_uses_chunk_timeout() {
        let (addr, server) = silent_listener().await;
        let transport = TcpTransport::new(addr)
            .with_request_timeout(Duration::from_millis(50))
            .with_chunk_timeout(Duration::from_millis(400));

        let started = tokio::time::Instant::now();
        let err = transport.health().await.unwrap_err();
        assert_eq!(err, TransportError::Timeout);
        assert!(started.elapsed() < Duration::from_millis(400));

        let started = tokio::time::Instant::now();
        let err = transport
            .send_chunk(
                SendChunkRequest {
                    task_id: "t1".into(),
                    index: 0,
                    chunk_digest: None,
                },
                vec![0u8; 16],
            )
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(400));
        server.abort();
    }

    #[tokio::test]
    async fn connection_refused_is_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = TcpTransport::new(addr);
        let err = transport.health().await.unwrap_err();
        assert!(matches!(err, TransportError::Network(_)));
    }
}
