use std::io::SeekFrom;
use std::path::Path;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::TransferError;

/// Default digest window: 2 MiB.
///
/// Independent of chunk size; bounds the memory held while hashing.
pub const DEFAULT_DIGEST_WINDOW: usize = 2 * 1024 * 1024;

/// Content digest algorithm. Digests are rendered as lowercase hex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    /// Creates an incremental hasher for this algorithm.
    pub fn hasher(self) -> Hasher {
        match self {
            DigestAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            DigestAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    /// Length of a hex digest produced by this algorithm.
    pub fn hex_len(self) -> usize {
        match self {
            DigestAlgorithm::Md5 => 32,
            DigestAlgorithm::Sha256 => 64,
        }
    }

    /// Infers the algorithm that produced a hex digest.
    ///
    /// Returns `None` for anything that is not lowercase hex of a known length.
    pub fn detect(digest: &str) -> Option<Self> {
        if !digest
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return None;
        }
        match digest.len() {
            32 => Some(DigestAlgorithm::Md5),
            64 => Some(DigestAlgorithm::Sha256),
            _ => None,
        }
    }
}

/// Incremental hasher over either supported algorithm.
pub enum Hasher {
    Md5(Md5),
    Sha256(Sha256),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    /// Consumes the hasher and returns the hex-encoded digest.
    pub fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Computes the digest of `data` and returns it hex-encoded.
pub fn checksum_bytes(algorithm: DigestAlgorithm, data: &[u8]) -> String {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    hasher.finalize_hex()
}

/// Streams a file through a hasher one window at a time.
///
/// Yields to the runtime between windows so a long digest never monopolizes
/// a worker thread, and stops with [`TransferError::Cancelled`] as soon as
/// the cancellation token fires.
#[derive(Debug, Clone)]
pub struct Digester {
    algorithm: DigestAlgorithm,
    window: usize,
    cancel: CancellationToken,
}

impl Digester {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self {
            algorithm,
            window: DEFAULT_DIGEST_WINDOW,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the window size in bytes.
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Attaches a cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Digests the whole file at `path`.
    ///
    /// `progress` is called after every window with `(processed, total)`.
    pub async fn digest_file<F>(&self, path: &Path, progress: F) -> Result<String, TransferError>
    where
        F: FnMut(u64, u64),
    {
        let len = tokio::fs::metadata(path).await?.len();
        self.digest_range(path, 0, len, progress).await
    }

    /// Digests `len` bytes of the file at `path` starting at `offset`.
    pub async fn digest_range<F>(
        &self,
        path: &Path,
        offset: u64,
        len: u64,
        mut progress: F,
    ) -> Result<String, TransferError>
    where
        F: FnMut(u64, u64),
    {
        if self.window == 0 {
            return Err(TransferError::InvalidWindow);
        }

        let mut file = tokio::fs::File::open(path).await?;
        let file_size = file.metadata().await?.len();
        if offset.saturating_add(len) > file_size {
            return Err(TransferError::OutOfRange {
                offset,
                len,
                file_size,
            });
        }
        file.seek(SeekFrom::Start(offset)).await?;

        let mut hasher = self.algorithm.hasher();
        let mut buf = vec![0u8; self.window.min(len as usize).max(1)];
        let mut processed = 0u64;

        while processed < len {
            let want = (len - processed).min(buf.len() as u64) as usize;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(processed, total = len, "digest cancelled");
                    return Err(TransferError::Cancelled);
                }
                res = file.read_exact(&mut buf[..want]) => {
                    res?;
                }
            }
            hasher.update(&buf[..want]);
            processed += want as u64;
            progress(processed, len);
            tokio::task::yield_now().await;
        }

        Ok(hasher.finalize_hex())
    }
}
