//! Transport abstraction between a session and a coordinator.

use std::future::Future;
use std::pin::Pin;

use chunkup_protocol::messages::{
    CheckExistingRequest, CheckExistingResponse, DeleteTaskRequest, DeleteTaskResponse,
    FinalizeRequest, FinalizeResponse, InitializeTaskRequest, InitializeTaskResponse,
    ListMissingRequest, ListMissingResponse, SendChunkRequest, SendChunkResponse,
    TaskStatusRequest, TaskStatusResponse,
};
use chunkup_protocol::{ErrorClass, ErrorKind, WireError};

/// Boxed future returned by [`UploadTransport`] methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Failure of a single request/response exchange.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    /// The coordinator answered with a structured error.
    #[error("remote error: {0}")]
    Remote(WireError),

    /// The response could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Network(_) => ErrorKind::Network,
            TransportError::Timeout => ErrorKind::Timeout,
            TransportError::Remote(e) => e.kind,
            TransportError::Protocol(_) => ErrorKind::InvalidRequest,
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.kind().class()
    }

    /// The structured remote error, if any.
    pub fn remote(&self) -> Option<&WireError> {
        match self {
            TransportError::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WireError> for TransportError {
    fn from(e: WireError) -> Self {
        TransportError::Remote(e)
    }
}

/// Request/response channel to an upload coordinator.
///
/// Implemented by the in-process and TCP transports. Dropping a returned
/// future abandons the request; implementations must not leave partial
/// side effects visible on the sender when that happens.
pub trait UploadTransport: Send + Sync {
    fn check_existing(&self, req: CheckExistingRequest) -> TransportFuture<'_, CheckExistingResponse>;

    fn initialize(&self, req: InitializeTaskRequest) -> TransportFuture<'_, InitializeTaskResponse>;

    /// Sends one chunk. `data` travels as the binary payload.
    fn send_chunk(
        &self,
        req: SendChunkRequest,
        data: Vec<u8>,
    ) -> TransportFuture<'_, SendChunkResponse>;

    fn list_missing(&self, req: ListMissingRequest) -> TransportFuture<'_, ListMissingResponse>;

    fn finalize(&self, req: FinalizeRequest) -> TransportFuture<'_, FinalizeResponse>;

    fn delete_task(&self, req: DeleteTaskRequest) -> TransportFuture<'_, DeleteTaskResponse>;

    fn task_status(&self, req: TaskStatusRequest) -> TransportFuture<'_, TaskStatusResponse>;
}
