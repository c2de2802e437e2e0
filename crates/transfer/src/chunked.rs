use std::io::SeekFrom;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::TransferError;

/// A contiguous byte range of the source file.
///
/// Immutable once produced by [`partition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub offset: u64,
    pub size: u32,
}

impl ChunkDescriptor {
    /// Offset one past the last byte of this chunk.
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.size)
    }
}

/// Number of chunks needed to cover `file_size` bytes.
pub fn chunk_count(file_size: u64, chunk_size: u32) -> Result<u32, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidChunkSize);
    }
    if file_size == 0 {
        return Err(TransferError::EmptyFile);
    }
    let count = file_size.div_ceil(u64::from(chunk_size));
    u32::try_from(count).map_err(|_| TransferError::TooManyChunks(count))
}

/// Splits a file of `file_size` bytes into chunks of `chunk_size` bytes.
///
/// Every chunk except the last is exactly `chunk_size` bytes; the last one
/// holds the remainder. Zero-byte files are rejected.
pub fn partition(file_size: u64, chunk_size: u32) -> Result<Vec<ChunkDescriptor>, TransferError> {
    let count = chunk_count(file_size, chunk_size)?;
    let step = u64::from(chunk_size);

    Ok((0..count)
        .map(|index| {
            let offset = u64::from(index) * step;
            let size = (file_size - offset).min(step) as u32;
            ChunkDescriptor {
                index,
                offset,
                size,
            }
        })
        .collect())
}

/// Reads the bytes of one chunk from `path`.
pub async fn read_chunk(path: &Path, chunk: &ChunkDescriptor) -> Result<Vec<u8>, TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    let file_size = file.metadata().await?.len();
    if chunk.end() > file_size {
        return Err(TransferError::OutOfRange {
            offset: chunk.offset,
            len: u64::from(chunk.size),
            file_size,
        });
    }

    file.seek(SeekFrom::Start(chunk.offset)).await?;
    let mut buf = vec![0u8; chunk.size as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}
