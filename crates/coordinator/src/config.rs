use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default retention for unfinished tasks: 24 h.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Default interval between expiry sweeps: 1 h.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default upper bound on a single chunk payload: 100 MiB.
pub const DEFAULT_MAX_CHUNK_SIZE: u32 = 100 * 1024 * 1024;

/// Upload coordinator configuration.
///
/// Durations use human-readable strings in JSON (`"24h"`, `"90s"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoordinatorConfig {
    /// Root of the on-disk layout (`chunks/` and `artifacts/`).
    pub root_dir: PathBuf,
    /// Unfinished tasks older than this are discarded by the sweeper.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    pub max_chunk_size: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./chunkup-data"),
            retention: DEFAULT_RETENTION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

impl CoordinatorConfig {
    /// Creates a config rooted at `root_dir` with default limits.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Default::default()
        }
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.root_dir.join("chunks")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root_dir.join("artifacts")
    }

    /// Loads a config from a JSON file, keeping defaults for absent fields.
    pub fn from_file(path: &Path) -> Result<Self, crate::CoordinatorError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
