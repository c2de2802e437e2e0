use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Point-in-time transfer progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    /// Bytes acknowledged by the receiver.
    pub loaded: u64,
    pub total: u64,
    /// 0.0 to 100.0.
    pub percentage: f64,
    /// Bytes per second over the sampling window.
    pub speed: f64,
    /// `None` while the speed is unknown.
    pub remaining_time: Option<Duration>,
}

impl ProgressSnapshot {
    /// Projects byte accounting and a measured speed into a snapshot.
    pub fn project(loaded: u64, total: u64, speed: f64) -> Self {
        let percentage = if total == 0 {
            0.0
        } else {
            (loaded as f64 / total as f64 * 100.0).min(100.0)
        };
        let remaining = total.saturating_sub(loaded);
        let remaining_time = if remaining == 0 {
            Some(Duration::ZERO)
        } else if speed > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / speed))
        } else {
            None
        };

        Self {
            loaded,
            total,
            percentage,
            speed,
            remaining_time,
        }
    }
}

/// Sampling window for [`SpeedCalculator::default`].
pub const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_SPEED_SAMPLES: usize = 100;

/// Throughput over the acknowledgements of a recent time window.
///
/// Shared by concurrent chunk completions, so samples sit behind a lock.
pub struct SpeedCalculator {
    window: Duration,
    capacity: usize,
    /// `(acknowledged at, bytes)`, oldest first.
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_SPEED_WINDOW, DEFAULT_SPEED_SAMPLES)
    }
}

impl SpeedCalculator {
    /// Keeps at most `capacity` samples no older than `window`.
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(2),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn add_sample(&self, bytes: u64) {
        let now = Instant::now();
        let mut samples = self.lock();
        samples.push_back((now, bytes));
        while let Some(&(at, _)) = samples.front() {
            if now.duration_since(at) <= self.window && samples.len() <= self.capacity {
                break;
            }
            samples.pop_front();
        }
    }

    /// Bytes per second between the oldest and newest sample.
    ///
    /// The oldest sample only marks where the window starts, so its bytes
    /// are not counted. Below two samples the speed is 0.0.
    pub fn bytes_per_second(&self) -> f64 {
        let samples = self.lock();
        let (Some(&(from, _)), Some(&(to, _))) = (samples.front(), samples.back()) else {
            return 0.0;
        };
        let elapsed = to.duration_since(from);
        if elapsed.is_zero() {
            return 0.0;
        }
        let bytes: u64 = samples.iter().skip(1).map(|&(_, b)| b).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<(Instant, u64)>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
