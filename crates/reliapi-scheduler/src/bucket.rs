//! Token bucket state.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// A token bucket with continuous refill and a concurrency semaphore.
///
/// Tokens refill proportionally to elapsed time and cap at `max_qps`.
/// `burst_size` is carried for future scheduling logic but does not enter
/// the consume/refill math.
pub struct TokenBucket {
    pub max_qps: f64,
    pub burst_size: u32,
    pub tokens: f64,
    pub last_refill: Instant,
    pub max_concurrent: u32,
    pub last_accessed: Instant,
    pub(crate) semaphore: Arc<Semaphore>,
}

impl TokenBucket {
    pub fn new(max_qps: f64, burst_size: u32, max_concurrent: u32) -> Self {
        let now = Instant::now();
        Self {
            max_qps,
            burst_size,
            tokens: max_qps,
            last_refill: now,
            max_concurrent,
            last_accessed: now,
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.max_qps).min(self.max_qps);
            self.last_refill = now;
        }
    }

    /// Attempts to consume `tokens` tokens. Refills first and stamps the
    /// access time either way.
    pub fn consume(&mut self, tokens: f64) -> bool {
        let now = Instant::now();
        self.refill(now);
        self.last_accessed = now;
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// Estimated wait until one token is available.
    pub fn retry_after(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.max_qps)
    }

    pub(crate) fn semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.semaphore)
    }
}
