use chunkup_protocol::constants::{
    ERR_CODE_BAD_REQUEST, ERR_CODE_CONFLICT, ERR_CODE_INSUFFICIENT_STORAGE, ERR_CODE_INTERNAL,
    ERR_CODE_NOT_FOUND, ERR_CODE_UNPROCESSABLE,
};
use chunkup_protocol::{ErrorDetails, ErrorKind, WireError};

/// Errors produced by the upload coordinator.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("chunk index {index} out of range (chunk count {chunk_count})")]
    InvalidIndex { index: u32, chunk_count: u32 },

    #[error("chunk {index} digest mismatch: expected {expected}, got {actual}")]
    ChunkDigestMismatch {
        index: u32,
        expected: String,
        actual: String,
    },

    #[error("task incomplete: {} chunk(s) missing", missing.len())]
    IncompleteTask { missing: Vec<u32> },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoordinatorError {
    /// Machine-readable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::UnknownTask(_) => ErrorKind::UnknownTask,
            CoordinatorError::InvalidIndex { .. } => ErrorKind::InvalidIndex,
            CoordinatorError::ChunkDigestMismatch { .. } => ErrorKind::ChunkDigestMismatch,
            CoordinatorError::IncompleteTask { .. } => ErrorKind::IncompleteTask,
            CoordinatorError::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            CoordinatorError::DigestMismatch { .. } => ErrorKind::DigestMismatch,
            CoordinatorError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            CoordinatorError::Io(_) => ErrorKind::Storage,
            CoordinatorError::Json(_) => ErrorKind::Internal,
        }
    }

    /// Converts this error into its wire representation.
    pub fn to_wire(&self) -> WireError {
        let code = match self {
            CoordinatorError::UnknownTask(_) => ERR_CODE_NOT_FOUND,
            CoordinatorError::InvalidIndex { .. } | CoordinatorError::InvalidRequest(_) => {
                ERR_CODE_BAD_REQUEST
            }
            CoordinatorError::IncompleteTask { .. } => ERR_CODE_CONFLICT,
            CoordinatorError::ChunkDigestMismatch { .. }
            | CoordinatorError::SizeMismatch { .. }
            | CoordinatorError::DigestMismatch { .. } => ERR_CODE_UNPROCESSABLE,
            CoordinatorError::Io(_) => ERR_CODE_INSUFFICIENT_STORAGE,
            CoordinatorError::Json(_) => ERR_CODE_INTERNAL,
        };

        let details = match self {
            CoordinatorError::IncompleteTask { missing } => Some(ErrorDetails::missing(missing.clone())),
            CoordinatorError::ChunkDigestMismatch {
                expected, actual, ..
            }
            | CoordinatorError::DigestMismatch { expected, actual } => {
                Some(ErrorDetails::mismatch(expected, actual))
            }
            CoordinatorError::SizeMismatch { expected, actual } => Some(ErrorDetails::mismatch(
                expected.to_string(),
                actual.to_string(),
            )),
            _ => None,
        };

        let wire = WireError::new(code, self.kind(), self.to_string());
        match details {
            Some(d) => wire.with_details(d),
            None => wire,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkup_protocol::ErrorClass;

    #[test]
    fn incomplete_task_carries_missing_indices() {
        let err = CoordinatorError::IncompleteTask {
            missing: vec![1, 3],
        };
        let wire = err.to_wire();
        assert_eq!(wire.code, 409);
        assert_eq!(wire.kind, ErrorKind::IncompleteTask);
        assert_eq!(wire.missing_indices(), &[1, 3]);
    }

    #[test]
    fn size_mismatch_carries_expected_and_actual() {
        let wire = CoordinatorError::SizeMismatch {
            expected: 10,
            actual: 9,
        }
        .to_wire();
        let details = wire.details.unwrap();
        assert_eq!(details.expected.as_deref(), Some("10"));
        assert_eq!(details.actual.as_deref(), Some("9"));
        assert_eq!(wire.code, 422);
    }

    #[test]
    fn storage_failure_is_capacity() {
        let err = CoordinatorError::Io(std::io::Error::other("disk full"));
        let wire = err.to_wire();
        assert_eq!(wire.code, 507);
        assert_eq!(wire.class(), ErrorClass::Capacity);
    }

    #[test]
    fn unknown_task_is_protocol() {
        let wire = CoordinatorError::UnknownTask("t".into()).to_wire();
        assert_eq!(wire.code, 404);
        assert_eq!(wire.class(), ErrorClass::Protocol);
        assert!(wire.details.is_none());
    }
}
