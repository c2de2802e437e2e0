use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::{RawValue, to_raw_value};

use crate::constants::MessageType;
use crate::types::{ErrorClass, ErrorDetails, ErrorKind};

/// Error details in a wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?} ({code}): {message}")]
pub struct WireError {
    pub code: i32,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

impl WireError {
    pub fn new(code: i32, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code,
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Attaches structured detail to this error.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = Some(details);
        self
    }

    /// Returns the failure class of this error.
    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    /// Returns the missing indices reported with this error, if any.
    pub fn missing_indices(&self) -> &[u32] {
        self.details
            .as_ref()
            .map(|d| d.missing_indices.as_slice())
            .unwrap_or(&[])
    }
}

/// One request or response on the wire.
///
/// `payload` stays raw JSON until the handler knows which body type the
/// `type` field calls for. Failures carry `type = "error"` and an `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Message {
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: id.into(),
            msg_type,
            payload: payload.map(to_raw_value).transpose()?,
            error: None,
        })
    }

    pub fn error(id: impl Into<String>, error: WireError) -> Self {
        Self {
            id: id.into(),
            msg_type: MessageType::Error,
            payload: None,
            error: Some(error),
        }
    }

    /// Decodes the body. `Ok(None)` when the message has none.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.payload
            .as_deref()
            .map(|raw| serde_json::from_str(raw.get()))
            .transpose()
    }

    /// Builds the response to this request, reusing its id.
    pub fn reply<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Self::new(self.id.clone(), msg_type, payload)
    }

    pub fn reply_error(&self, error: WireError) -> Self {
        Self::error(self.id.clone(), error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ERR_CODE_BAD_REQUEST;
    use crate::messages::TaskStatusResponse;

    #[test]
    fn request_envelope_json_shape() {
        let msg = Message::new(
            "req-7",
            MessageType::TaskStatus,
            Some(&serde_json::json!({"taskId": "t1"})),
        )
        .unwrap();
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["id"], "req-7");
        assert_eq!(value["type"], "task_status");
        assert_eq!(value["payload"]["taskId"], "t1");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn invalid_index_error_frame() {
        let err = WireError::new(ERR_CODE_BAD_REQUEST, ErrorKind::InvalidIndex, "index 12 >= 10");
        let msg = Message::error("req-3", err);
        assert_eq!(msg.msg_type, MessageType::Error);
        let err = msg.error.unwrap();
        assert_eq!(err.code, ERR_CODE_BAD_REQUEST);
        assert_eq!(err.kind, ErrorKind::InvalidIndex);
        assert_eq!(err.class(), ErrorClass::Protocol);
    }

    #[test]
    fn typed_payload_decodes() {
        let status = TaskStatusResponse {
            task_id: "t1".into(),
            name: "movie.mkv".into(),
            size: 100,
            received_count: 1,
            chunk_count: 4,
            received_indices: vec![2],
            progress: 25.0,
        };
        let msg = Message::new("m1", MessageType::TaskStatusResponse, Some(&status)).unwrap();
        let parsed: Option<TaskStatusResponse> = msg.parse_payload().unwrap();
        assert_eq!(parsed.unwrap(), status);
    }

    #[test]
    fn bodyless_health_request() {
        let msg = Message::new::<()>("h1", MessageType::Health, None).unwrap();
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"id":"h1","type":"health"}"#
        );
        let decoded: Message = serde_json::from_str(r#"{"id":"h1","type":"health"}"#).unwrap();
        assert!(decoded.parse_payload::<serde_json::Value>().unwrap().is_none());
    }

    #[test]
    fn error_details_survive_json() {
        let err = WireError::new(409, ErrorKind::IncompleteTask, "2 chunks missing")
            .with_details(ErrorDetails::missing(vec![3, 7]));
        let msg = Message::error("e1", err);
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: Message = serde_json::from_str(&json).unwrap();
        let err = parsed.error.unwrap();
        assert_eq!(err.missing_indices(), &[3, 7]);
        assert_eq!(err.class(), ErrorClass::Protocol);
    }

    #[test]
    fn reply_preserves_id() {
        let original = Message::new::<()>("req-42", MessageType::Health, None).unwrap();
        let reply = original
            .reply(MessageType::HealthResponse, Some(&serde_json::json!({})))
            .unwrap();
        assert_eq!(reply.id, "req-42");
        assert_eq!(reply.msg_type, MessageType::HealthResponse);

        let err = original.reply_error(WireError::new(500, ErrorKind::Internal, "boom"));
        assert_eq!(err.id, "req-42");
        assert_eq!(err.msg_type, MessageType::Error);
    }
}
