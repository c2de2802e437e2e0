use serde::{Deserialize, Serialize};

/// Machine-readable failure kind carried by every wire error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownTask,
    InvalidIndex,
    ChunkDigestMismatch,
    IncompleteTask,
    SizeMismatch,
    DigestMismatch,
    InvalidRequest,
    Storage,
    Network,
    Timeout,
    Cancelled,
    Internal,
}

/// Failure taxonomy used to decide how a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network failure or timeout: retried with backoff.
    Transient,
    /// Digest or size mismatch: never retried blindly.
    Integrity,
    /// Desynchronized session/registry state: surfaced immediately.
    Protocol,
    /// Receiver storage failure: surfaced as transient and retried.
    Capacity,
}

impl ErrorKind {
    /// Classifies this kind into the failure taxonomy.
    pub fn class(self) -> ErrorClass {
        match self {
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Internal => ErrorClass::Transient,
            ErrorKind::ChunkDigestMismatch | ErrorKind::SizeMismatch | ErrorKind::DigestMismatch => {
                ErrorClass::Integrity
            }
            ErrorKind::UnknownTask
            | ErrorKind::InvalidIndex
            | ErrorKind::IncompleteTask
            | ErrorKind::InvalidRequest
            | ErrorKind::Cancelled => ErrorClass::Protocol,
            ErrorKind::Storage => ErrorClass::Capacity,
        }
    }
}

/// Structured detail attached to a wire error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_indices: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl ErrorDetails {
    /// Detail listing the indices still missing from a task.
    pub fn missing(indices: Vec<u32>) -> Self {
        Self {
            missing_indices: indices,
            ..Default::default()
        }
    }

    /// Detail describing an expected vs. actual mismatch.
    pub fn mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self {
            expected: Some(expected.into()),
            actual: Some(actual.into()),
            ..Default::default()
        }
    }
}

/// Content identity of a file independent of any transfer session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFingerprint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub size: u64,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::ChunkDigestMismatch).unwrap(),
            "\"chunk_digest_mismatch\""
        );
        let kind: ErrorKind = serde_json::from_str("\"unknown_task\"").unwrap();
        assert_eq!(kind, ErrorKind::UnknownTask);
    }

    #[test]
    fn error_classes() {
        assert_eq!(ErrorKind::Timeout.class(), ErrorClass::Transient);
        assert_eq!(ErrorKind::Storage.class(), ErrorClass::Capacity);
        assert_eq!(ErrorKind::DigestMismatch.class(), ErrorClass::Integrity);
        assert_eq!(ErrorKind::InvalidIndex.class(), ErrorClass::Protocol);
    }

    #[test]
    fn error_details_omit_empty() {
        let json = serde_json::to_string(&ErrorDetails::default()).unwrap();
        assert_eq!(json, "{}");

        let json = serde_json::to_string(&ErrorDetails::missing(vec![1, 3])).unwrap();
        assert_eq!(json, r#"{"missingIndices":[1,3]}"#);
    }

    #[test]
    fn fingerprint_without_digest() {
        let fp = TaskFingerprint {
            digest: None,
            size: 10,
            name: "a.bin".into(),
        };
        let json = serde_json::to_string(&fp).unwrap();
        assert!(!json.contains("digest"));
    }
}
