//! Wire vocabulary shared by the upload sender and the upload coordinator.
//!
//! Every logical operation is a request/response pair carried inside a
//! JSON [`Message`] envelope. Failures travel as a [`WireError`] with a
//! machine-readable [`ErrorKind`] and enough structured detail for the
//! sender to decide whether to retry a chunk, re-finalize, or abort.

pub mod constants;
pub mod envelope;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{Message, WireError};
pub use types::{ErrorClass, ErrorDetails, ErrorKind, TaskFingerprint};
