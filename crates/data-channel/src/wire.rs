//! TCP frame format for protocol messages.
//!
//! # Wire format
//!
//! ```text
//! FRAME (either direction):
//!   [4 bytes BE: header_len]
//!   [header_len bytes: JSON envelope {id, type, payload?, error?}]
//!   [4 bytes BE: payload_len]
//!   [payload_len bytes: binary payload (chunk bytes for send_chunk, else empty)]
//! ```
//!
//! A connection carries any number of request/response frame pairs. A
//! clean close between frames ends the conversation.

use std::io::ErrorKind;

use chunkup_protocol::Message;
use chunkup_protocol::constants::{MAX_HEADER_SIZE, MAX_PAYLOAD_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DataChannelError;

/// One decoded frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub message: Message,
    pub payload: Vec<u8>,
}

/// Writes a frame. The caller flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
    payload: &[u8],
) -> Result<(), DataChannelError> {
    let header = serde_json::to_vec(message)?;
    check_len("header", header.len(), MAX_HEADER_SIZE)?;
    check_len("payload", payload.len(), MAX_PAYLOAD_SIZE)?;

    writer.write_u32(header.len() as u32).await?;
    writer.write_all(&header).await?;
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Reads a frame.
///
/// Returns `None` if the peer closed the connection before a new frame.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, DataChannelError> {
    let header_len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    check_len("header", header_len, MAX_HEADER_SIZE)?;

    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header).await?;
    let message: Message = serde_json::from_slice(&header)
        .map_err(|e| DataChannelError::Protocol(format!("invalid envelope: {e}")))?;

    let payload_len = reader.read_u32().await? as usize;
    check_len("payload", payload_len, MAX_PAYLOAD_SIZE)?;
    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(Frame { message, payload }))
}

fn check_len(what: &'static str, len: usize, max: usize) -> Result<(), DataChannelError> {
    if len > max {
        return Err(DataChannelError::FrameTooLarge { what, len, max });
    }
    Ok(())
}
