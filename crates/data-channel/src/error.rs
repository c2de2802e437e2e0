//! Error types for the data channel.

use chunkup_session::TransportError;

/// Errors produced by the framed TCP channel.
#[derive(Debug, thiserror::Error)]
pub enum DataChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{what} of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        what: &'static str,
        len: usize,
        max: usize,
    },

    #[error("connection timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<DataChannelError> for TransportError {
    fn from(e: DataChannelError) -> Self {
        match e {
            DataChannelError::Io(e) => TransportError::Network(e.to_string()),
            DataChannelError::Timeout => TransportError::Timeout,
            DataChannelError::Cancelled => TransportError::Network("cancelled".into()),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}
