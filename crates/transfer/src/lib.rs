//! Sender-side building blocks for chunked transfers.
//!
//! Splits a file into contiguous chunks, computes streaming content digests
//! without holding the file in memory, and projects byte accounting into
//! user-facing progress.

mod chunked;
mod digest;
mod progress;
mod validation;

pub use chunked::{ChunkDescriptor, chunk_count, partition, read_chunk};
pub use digest::{DEFAULT_DIGEST_WINDOW, DigestAlgorithm, Digester, Hasher, checksum_bytes};
pub use progress::{ProgressSnapshot, SpeedCalculator};
pub use validation::validate_artifact_name;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("zero-byte files cannot be transferred")]
    EmptyFile,

    #[error("file too large: {0} chunks exceed the index space")]
    TooManyChunks(u64),

    #[error("digest window must be greater than zero")]
    InvalidWindow,

    #[error("range {offset}+{len} exceeds file size {file_size}")]
    OutOfRange { offset: u64, len: u64, file_size: u64 },

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("operation cancelled")]
    Cancelled,
}
