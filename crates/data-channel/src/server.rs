//! TCP server exposing a coordinator.
//!
//! Every accepted connection gets its own task that reads request frames,
//! dispatches them to the shared [`Coordinator`] and writes one response
//! frame per request. Failures travel back as `error` frames.

use std::net::SocketAddr;
use std::sync::Arc;

use chunkup_coordinator::{Coordinator, CoordinatorError};
use chunkup_protocol::constants::{
    ERR_CODE_BAD_REQUEST, ERR_CODE_INTERNAL, ERR_CODE_NOT_IMPLEMENTED,
};
use chunkup_protocol::messages::{
    CheckExistingRequest, DeleteTaskRequest, FinalizeRequest, InitializeTaskRequest,
    ListMissingRequest, SendChunkRequest, TaskStatusRequest,
};
use chunkup_protocol::{ErrorKind, Message, MessageType, WireError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DataChannelError;
use crate::wire::{read_frame, write_frame};
use crate::{TCP_BUFFER_SIZE, TCP_IDLE_TIMEOUT};

/// Serves a coordinator over TCP until cancelled.
pub struct CoordinatorServer {
    coordinator: Arc<Coordinator>,
    cancel: CancellationToken,
}

impl CoordinatorServer {
    pub fn new(coordinator: Arc<Coordinator>, cancel: CancellationToken) -> Self {
        Self {
            coordinator,
            cancel,
        }
    }

    /// Binds a listener on `addr`. Port 0 picks an ephemeral port.
    pub async fn bind(addr: &str) -> Result<TcpListener, DataChannelError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "coordinator listener bound");
        Ok(listener)
    }

    /// Accepts connections until the cancellation token fires.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), DataChannelError> {
        loop {
            let (stream, addr) = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("coordinator server stopped");
                    return Ok(());
                }
                result = listener.accept() => result?,
            };
            debug!(%addr, "connection accepted");

            let coordinator = Arc::clone(&self.coordinator);
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(coordinator, stream, addr, cancel).await {
                    warn!(%addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

async fn handle_connection(
    coordinator: Arc<Coordinator>,
    stream: TcpStream,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), DataChannelError> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::with_capacity(TCP_BUFFER_SIZE, reader);
    let mut writer = BufWriter::new(writer);

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DataChannelError::Cancelled),
            result = tokio::time::timeout(TCP_IDLE_TIMEOUT, read_frame(&mut reader)) => {
                match result {
                    Ok(Ok(Some(frame))) => frame,
                    Ok(Ok(None)) => {
                        debug!(%addr, "connection closed by peer");
                        return Ok(());
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Err(DataChannelError::Timeout),
                }
            }
        };

        let response = dispatch(&coordinator, &frame.message, &frame.payload).await;
        write_frame(&mut writer, &response, &[]).await?;
        writer.flush().await?;
    }
}

/// Handles one request message and builds its response.
///
/// Never fails: errors become `error` messages carrying a [`WireError`].
pub async fn dispatch(coordinator: &Coordinator, request: &Message, payload: &[u8]) -> Message {
    match handle(coordinator, request, payload).await {
        Ok(response) => response,
        Err(e) => {
            debug!(id = %request.id, kind = ?e.kind, error = %e.message, "request failed");
            request.reply_error(e)
        }
    }
}

async fn handle(
    coordinator: &Coordinator,
    request: &Message,
    payload: &[u8],
) -> Result<Message, WireError> {
    let Some(response_type) = request.msg_type.response() else {
        return Err(WireError::new(
            ERR_CODE_NOT_IMPLEMENTED,
            ErrorKind::InvalidRequest,
            format!("unsupported message type: {:?}", request.msg_type),
        ));
    };

    match request.msg_type {
        MessageType::CheckExisting => {
            let req: CheckExistingRequest = parse(request)?;
            let resp = coordinator.check_existing(&req).await.map_err(to_wire)?;
            respond(request, response_type, &resp)
        }
        MessageType::InitializeTask => {
            let req: InitializeTaskRequest = parse(request)?;
            let resp = coordinator.initialize(&req).await.map_err(to_wire)?;
            respond(request, response_type, &resp)
        }
        MessageType::SendChunk => {
            let req: SendChunkRequest = parse(request)?;
            let resp = coordinator
                .receive_chunk(&req, payload)
                .await
                .map_err(to_wire)?;
            respond(request, response_type, &resp)
        }
        MessageType::ListMissing => {
            let req: ListMissingRequest = parse(request)?;
            let resp = coordinator.list_missing(&req).map_err(to_wire)?;
            respond(request, response_type, &resp)
        }
        MessageType::Finalize => {
            let req: FinalizeRequest = parse(request)?;
            let resp = coordinator.finalize(&req).await.map_err(to_wire)?;
            respond(request, response_type, &resp)
        }
        MessageType::DeleteTask => {
            let req: DeleteTaskRequest = parse(request)?;
            let resp = coordinator
                .delete_task(&req.task_id)
                .await
                .map_err(to_wire)?;
            respond(request, response_type, &resp)
        }
        MessageType::TaskStatus => {
            let req: TaskStatusRequest = parse(request)?;
            let resp = coordinator.task_status(&req.task_id).map_err(to_wire)?;
            respond(request, response_type, &resp)
        }
        MessageType::Health => respond(request, response_type, &coordinator.health()),
        other => Err(WireError::new(
            ERR_CODE_NOT_IMPLEMENTED,
            ErrorKind::InvalidRequest,
            format!("unsupported message type: {other:?}"),
        )),
    }
}

fn parse<T: DeserializeOwned>(request: &Message) -> Result<T, WireError> {
    request
        .parse_payload()
        .map_err(|e| {
            WireError::new(
                ERR_CODE_BAD_REQUEST,
                ErrorKind::InvalidRequest,
                format!("invalid payload: {e}"),
            )
        })?
        .ok_or_else(|| {
            WireError::new(ERR_CODE_BAD_REQUEST, ErrorKind::InvalidRequest, "missing payload")
        })
}

fn respond<T: Serialize>(
    request: &Message,
    response_type: MessageType,
    body: &T,
) -> Result<Message, WireError> {
    request
        .reply(response_type, Some(body))
        .map_err(|e| WireError::new(ERR_CODE_INTERNAL, ErrorKind::Internal, e.to_string()))
}

fn to_wire(e: CoordinatorError) -> WireError {
    if e.kind() == ErrorKind::Storage {
        warn!(error = %e, "coordinator storage failure");
    }
    e.to_wire()
}
