use std::time::Duration;

use chunkup_protocol::ErrorClass;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue after the given delay.
    Retry(Duration),
    /// Stop and surface the failure.
    GiveUp,
}

impl RetryPolicy {
    /// Delay before retry number `retry_count` (1-based):
    /// `base * 2^(retry_count - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decides the fate of an attempt that failed with `class`, given the
    /// retry count already incremented for this failure.
    pub fn decide(&self, class: ErrorClass, retry_count: u32) -> RetryDecision {
        match class {
            ErrorClass::Protocol => RetryDecision::GiveUp,
            ErrorClass::Transient | ErrorClass::Capacity | ErrorClass::Integrity
                if retry_count < self.max_retries =>
            {
                RetryDecision::Retry(self.delay_for_attempt(retry_count))
            }
            _ => RetryDecision::GiveUp,
        }
    }
}
