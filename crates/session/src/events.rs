use chunkup_protocol::ErrorKind;
use chunkup_transfer::ProgressSnapshot;

/// Lifecycle and progress events emitted by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Whole-file digest progress.
    Digesting { processed: u64, total: u64 },
    /// Byte-level progress after a chunk is acknowledged.
    Progress(ProgressSnapshot),
    /// A chunk was acknowledged by the receiver.
    ChunkComplete {
        index: u32,
        completed: u32,
        total: u32,
    },
    /// The artifact is published. `instant` means no chunk was sent.
    Success {
        location: String,
        size: u64,
        instant: bool,
    },
    /// The session failed.
    Error { kind: ErrorKind, message: String },
    Paused,
    Resumed,
    Cancelled,
}
