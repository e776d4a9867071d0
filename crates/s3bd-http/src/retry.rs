//! Retry schedule
//!
//! Transient failures back off exponentially with jitter. The schedule is
//! bounded by a total pause budget rather than an attempt count, so a slow
//! sequence of 503s gives up in bounded time.

use std::time::Duration;

use rand::Rng;

/// HTTP status codes worth retrying
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// Jittered exponential backoff bounded by a total pause budget
pub struct RetrySchedule {
    next_pause_ms: u64,
    spent_ms: u64,
    max_total_ms: u64,
    jitter: bool,
}

impl RetrySchedule {
    #[must_use]
    pub fn new(initial_pause_ms: u64, max_total_ms: u64) -> Self {
        Self {
            next_pause_ms: initial_pause_ms.max(1),
            spent_ms: 0,
            max_total_ms,
            jitter: true,
        }
    }

    /// Deterministic schedule for tests
    #[must_use]
    pub fn without_jitter(initial_pause_ms: u64, max_total_ms: u64) -> Self {
        Self {
            jitter: false,
            ..Self::new(initial_pause_ms, max_total_ms)
        }
    }

    /// Next pause before retrying, or `None` when the budget is spent.
    pub fn next_pause(&mut self) -> Option<Duration> {
        if self.spent_ms >= self.max_total_ms {
            return None;
        }
        let base = self.next_pause_ms.min(self.max_total_ms - self.spent_ms);
        self.spent_ms += base;
        self.next_pause_ms = self.next_pause_ms.saturating_mul(2);

        let pause = if self.jitter && base > 1 {
            // Up to +25%, so synchronized clients fan out.
            base + rand::thread_rng().gen_range(0..=base / 4)
        } else {
            base
        };
        Some(Duration::from_millis(pause))
    }

    /// Milliseconds of pause budget consumed so far
    #[must_use]
    pub fn spent_ms(&self) -> u64 {
        self.spent_ms
    }
}
