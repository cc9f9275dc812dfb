use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use tokio::time::Duration;

thread_local! {
    static THREAD_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_os_rng());
}

/// Backoff between optimistic-concurrency retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryDelay {
    /// Base delay (in milliseconds) before applying exponential backoff and jitter
    base_delay_ms: u64,
    /// Maximum delay (in milliseconds) after applying exponential backoff and jitter
    max_delay_ms: u64,
}

impl RetryDelay {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    /// Calculates the delay for a given retry attempt using exponential backoff with full jitter.
    ///
    /// The exponential delay `base_delay * 2^retry_count` is capped at `max_delay`,
    /// then a value between 0 and the capped delay is picked at random so that
    /// writers contending on the same aggregate do not retry in lockstep.
    pub fn calculate_delay(&self, retry_count: u32) -> Duration {
        let exp_delay = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(retry_count));

        let capped_delay = exp_delay.min(self.max_delay_ms);

        let jittered_delay =
            THREAD_RNG.with(|rng| rng.borrow_mut().random_range(0..=capped_delay));

        Duration::from_millis(jittered_delay)
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self {
            base_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}
