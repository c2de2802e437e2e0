//! Sender side of a chunked upload.
//!
//! A [`TransferSession`] splits one file into chunks, optionally checks
//! whether the coordinator already holds its content, and uploads the
//! remaining chunks under bounded concurrency with retry, pause, resume
//! and cancel. It talks to the coordinator only through an
//! [`UploadTransport`].

pub mod config;
pub mod error;
pub mod events;
pub mod retry;
pub mod session;
pub mod store;
pub mod transport;

pub use config::{DEFAULT_CHUNK_SIZE, SessionConfig};
pub use error::SessionError;
pub use events::SessionEvent;
pub use retry::{RetryDecision, RetryPolicy};
pub use session::{Artifact, ChunkState, ChunkStatus, SessionBuilder, SessionStatus, TransferSession};
pub use store::{JsonFileStore, MemoryStore, ResumeRecord, SessionStore};
pub use transport::{TransportError, TransportFuture, UploadTransport};
