//! In-process transport.

use std::sync::Arc;

use chunkup_coordinator::{Coordinator, CoordinatorError};
use chunkup_protocol::messages::{
    CheckExistingRequest, CheckExistingResponse, DeleteTaskRequest, DeleteTaskResponse,
    FinalizeRequest, FinalizeResponse, InitializeTaskRequest, InitializeTaskResponse,
    ListMissingRequest, ListMissingResponse, SendChunkRequest, SendChunkResponse,
    TaskStatusRequest, TaskStatusResponse,
};
use chunkup_session::{TransportError, TransportFuture, UploadTransport};

/// Calls a [`Coordinator`] living in the same process.
///
/// Errors are converted to their wire form so the sender sees exactly what
/// it would see over TCP.
#[derive(Clone)]
pub struct LocalTransport {
    coordinator: Arc<Coordinator>,
}

impl LocalTransport {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }
}

fn remote(e: CoordinatorError) -> TransportError {
    TransportError::Remote(e.to_wire())
}

impl UploadTransport for LocalTransport {
    fn check_existing(
        &self,
        req: CheckExistingRequest,
    ) -> TransportFuture<'_, CheckExistingResponse> {
        Box::pin(async move { self.coordinator.check_existing(&req).await.map_err(remote) })
    }

    fn initialize(
        &self,
        req: InitializeTaskRequest,
    ) -> TransportFuture<'_, InitializeTaskResponse> {
        Box::pin(async move { self.coordinator.initialize(&req).await.map_err(remote) })
    }

    fn send_chunk(
        &self,
        req: SendChunkRequest,
        data: Vec<u8>,
    ) -> TransportFuture<'_, SendChunkResponse> {
        Box::pin(async move {
            self.coordinator
                .receive_chunk(&req, &data)
                .await
                .map_err(remote)
        })
    }

    fn list_missing(&self, req: ListMissingRequest) -> TransportFuture<'_, ListMissingResponse> {
        Box::pin(async move { self.coordinator.list_missing(&req).map_err(remote) })
    }

    fn finalize(&self, req: FinalizeRequest) -> TransportFuture<'_, FinalizeResponse> {
        Box::pin(async move { self.coordinator.finalize(&req).await.map_err(remote) })
    }

    fn delete_task(&self, req: DeleteTaskRequest) -> TransportFuture<'_, DeleteTaskResponse> {
        Box::pin(async move { self.coordinator.delete_task(&req.task_id).await.map_err(remote) })
    }

    fn task_status(&self, req: TaskStatusRequest) -> TransportFuture<'_, TaskStatusResponse> {
        Box::pin(async move { self.coordinator.task_status(&req.task_id).map_err(remote) })
    }
}
