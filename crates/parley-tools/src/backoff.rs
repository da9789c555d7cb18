//! Exponential backoff with jitter

use std::time::Duration;

use rand::Rng;

/// Retry delay schedule: `base * 2^attempt`, capped at `max`, with jitter.
///
/// The jittered delay is drawn uniformly from `[delay / 2, delay]`, so retries
/// from many callers spread out without ever waiting longer than the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `attempt` (0-based), without jitter
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Jittered delay before retry number `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let millis = ceiling.as_millis() as u64;
        if millis < 2 {
            return ceiling;
        }
        Duration::from_millis(rand::rng().random_range(millis / 2..=millis))
    }
}
