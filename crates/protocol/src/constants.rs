use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum size of a JSON envelope header in bytes (1 MB).
pub const MAX_HEADER_SIZE: usize = 1024 * 1024;

/// Maximum size of a binary frame payload in bytes (100 MB).
pub const MAX_PAYLOAD_SIZE: usize = 100 * 1024 * 1024;

/// Default chunk size negotiated when the sender does not override it (5 MiB).
pub const DEFAULT_CHUNK_SIZE: u32 = 5 * 1024 * 1024;

/// Timeout for request/response operations that carry no chunk data.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for finalize requests.
///
/// Reassembly reads every chunk back and re-digests the artifact, so it
/// scales with file size rather than chunk size.
pub const FINALIZE_TIMEOUT: Duration = Duration::from_secs(600);

/// Wire message type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Requests from sender to coordinator
    #[serde(rename = "check_existing")]
    CheckExisting,
    #[serde(rename = "initialize_task")]
    InitializeTask,
    #[serde(rename = "send_chunk")]
    SendChunk,
    #[serde(rename = "list_missing")]
    ListMissing,
    #[serde(rename = "finalize")]
    Finalize,
    #[serde(rename = "delete_task")]
    DeleteTask,
    #[serde(rename = "task_status")]
    TaskStatus,
    #[serde(rename = "health")]
    Health,

    // Responses from coordinator to sender
    #[serde(rename = "check_existing_response")]
    CheckExistingResponse,
    #[serde(rename = "initialize_task_response")]
    InitializeTaskResponse,
    #[serde(rename = "send_chunk_response")]
    SendChunkResponse,
    #[serde(rename = "list_missing_response")]
    ListMissingResponse,
    #[serde(rename = "finalize_response")]
    FinalizeResponse,
    #[serde(rename = "delete_task_response")]
    DeleteTaskResponse,
    #[serde(rename = "task_status_response")]
    TaskStatusResponse,
    #[serde(rename = "health_response")]
    HealthResponse,
    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Returns the response type paired with a request type.
    pub fn response(self) -> Option<MessageType> {
        match self {
            MessageType::CheckExisting => Some(MessageType::CheckExistingResponse),
            MessageType::InitializeTask => Some(MessageType::InitializeTaskResponse),
            MessageType::SendChunk => Some(MessageType::SendChunkResponse),
            MessageType::ListMissing => Some(MessageType::ListMissingResponse),
            MessageType::Finalize => Some(MessageType::FinalizeResponse),
            MessageType::DeleteTask => Some(MessageType::DeleteTaskResponse),
            MessageType::TaskStatus => Some(MessageType::TaskStatusResponse),
            MessageType::Health => Some(MessageType::HealthResponse),
            _ => None,
        }
    }
}

/// Common wire error codes.
pub const ERR_CODE_BAD_REQUEST: i32 = 400;
pub const ERR_CODE_NOT_FOUND: i32 = 404;
pub const ERR_CODE_CONFLICT: i32 = 409;
pub const ERR_CODE_UNPROCESSABLE: i32 = 422;
pub const ERR_CODE_INTERNAL: i32 = 500;
pub const ERR_CODE_NOT_IMPLEMENTED: i32 = 501;
pub const ERR_CODE_INSUFFICIENT_STORAGE: i32 = 507;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_serialization() {
        assert_eq!(
            serde_json::to_string(&MessageType::InitializeTask).unwrap(),
            "\"initialize_task\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::SendChunkResponse).unwrap(),
            "\"send_chunk_response\""
        );
    }

    #[test]
    fn message_type_deserialization() {
        let mt: MessageType = serde_json::from_str("\"finalize\"").unwrap();
        assert_eq!(mt, MessageType::Finalize);
    }

    #[test]
    fn unknown_message_type() {
        let mt: MessageType = serde_json::from_str("\"some_future_type\"").unwrap();
        assert_eq!(mt, MessageType::Unknown);
    }

    #[test]
    fn every_request_has_a_response() {
        for req in [
            MessageType::CheckExisting,
            MessageType::InitializeTask,
            MessageType::SendChunk,
            MessageType::ListMissing,
            MessageType::Finalize,
            MessageType::DeleteTask,
            MessageType::TaskStatus,
            MessageType::Health,
        ] {
            assert!(req.response().is_some(), "{req:?} has no response type");
        }
        assert_eq!(MessageType::Error.response(), None);
    }
}
