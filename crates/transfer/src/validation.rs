use std::path::{Component, Path};

use crate::TransferError;

/// Maximum artifact name length in bytes.
const MAX_NAME_LEN: usize = 255;

/// Validates that an artifact name is a single, plain file name.
///
/// Rejects:
/// - Empty names and names longer than 255 bytes
/// - Path separators (`/` or `\`) and NUL bytes
/// - `.` and `..`
/// - Absolute paths and Windows prefix components (`C:`)
pub fn validate_artifact_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidName("empty name".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(TransferError::InvalidName(format!(
            "name exceeds {MAX_NAME_LEN} bytes"
        )));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(TransferError::InvalidName(format!(
            "path separators not allowed: {name}"
        )));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        (Some(Component::ParentDir), _) | (Some(Component::CurDir), _) => Err(
            TransferError::InvalidName(format!("relative directory not allowed: {name}")),
        ),
        _ => Err(TransferError::InvalidName(format!(
            "not a plain file name: {name}"
        ))),
    }
}
