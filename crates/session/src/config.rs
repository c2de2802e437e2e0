use std::path::Path;
use std::time::Duration;

use chunkup_transfer::{DEFAULT_DIGEST_WINDOW, DigestAlgorithm};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::retry::RetryPolicy;

/// Default chunk size: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: u32 = chunkup_protocol::constants::DEFAULT_CHUNK_SIZE;

/// Sender-side session configuration.
///
/// Every field has a default, so a partial JSON object is a valid config.
/// Durations are human-readable strings (`"1s"`, `"30s"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub chunk_size: u32,
    /// Read window used while computing the whole-file digest.
    pub digest_window: usize,
    /// Maximum chunk transmissions in flight at once.
    pub max_concurrent: usize,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,
    /// Upper bound on a single backoff delay.
    #[serde(with = "humantime_serde")]
    pub retry_max_delay: Duration,
    /// Per-chunk transmission timeout.
    #[serde(with = "humantime_serde")]
    pub chunk_timeout: Duration,
    pub verify_chunk_digest: bool,
    pub enable_instant_upload: bool,
    pub digest_algorithm: DigestAlgorithm,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            digest_window: DEFAULT_DIGEST_WINDOW,
            max_concurrent: 3,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1000),
            retry_max_delay: Duration::from_secs(30),
            chunk_timeout: Duration::from_secs(30),
            verify_chunk_digest: false,
            enable_instant_upload: true,
            digest_algorithm: DigestAlgorithm::Md5,
        }
    }
}

impl SessionConfig {
    /// Rejects values the session cannot run with.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.chunk_size == 0 {
            return Err(SessionError::InvalidConfig("chunkSize must be greater than zero".into()));
        }
        if self.max_concurrent == 0 {
            return Err(SessionError::InvalidConfig(
                "maxConcurrent must be greater than zero".into(),
            ));
        }
        if self.digest_window == 0 {
            return Err(SessionError::InvalidConfig(
                "digestWindow must be greater than zero".into(),
            ));
        }
        if self.chunk_timeout.is_zero() {
            return Err(SessionError::InvalidConfig(
                "chunkTimeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Whether the session computes a whole-file digest before uploading.
    pub fn needs_digest(&self) -> bool {
        self.enable_instant_upload || self.verify_chunk_digest
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
        }
    }

    /// Loads a config from a JSON file, keeping defaults for absent fields.
    pub fn from_file(path: &Path) -> Result<Self, SessionError> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}
