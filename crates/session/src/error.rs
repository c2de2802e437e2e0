use chunkup_protocol::ErrorKind;
use chunkup_transfer::TransferError;

use crate::session::SessionStatus;
use crate::transport::TransportError;

/// Errors produced by a transfer session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot {action} a session that is {status:?}")]
    InvalidState {
        action: &'static str,
        status: SessionStatus,
    },

    #[error("session cancelled")]
    Cancelled,

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("chunk {index} failed after {retries} attempt(s): {source}")]
    ChunkFailed {
        index: u32,
        retries: u32,
        #[source]
        source: TransportError,
    },

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    /// Machine-readable kind reported in `error` events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::InvalidConfig(_) | SessionError::InvalidState { .. } => {
                ErrorKind::InvalidRequest
            }
            SessionError::Cancelled | SessionError::Transfer(TransferError::Cancelled) => {
                ErrorKind::Cancelled
            }
            SessionError::Transfer(_) | SessionError::Io(_) => ErrorKind::Storage,
            SessionError::ChunkFailed { source, .. } => source.kind(),
            SessionError::Transport(e) => e.kind(),
            SessionError::Json(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}
