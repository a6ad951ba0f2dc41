//! Backoff shapes.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fraction of the exponential delay added as uniform jitter.
const JITTER_FRACTION: f64 = 0.3;

/// Delay growth shape between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backoff {
    /// Exponential doubling plus up to 30% uniform jitter.
    ExpJitter,
    /// Plain exponential doubling.
    Exp,
    /// Delay grows linearly with the attempt number.
    Linear,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::ExpJitter
    }
}

impl Backoff {
    /// Computes the delay before retry `attempt` (1-based).
    pub fn delay(&self, attempt: u32, base: Duration, max: Duration) -> Duration {
        let base_s = base.as_secs_f64();
        let exponent = attempt.saturating_sub(1).min(32);
        let delay_s = match self {
            Backoff::ExpJitter => {
                let exp = base_s * f64::from(2u32.saturating_pow(exponent).max(1));
                let jitter = rand::rng().random_range(0.0..=exp * JITTER_FRACTION);
                exp + jitter
            }
            Backoff::Exp => base_s * f64::from(2u32.saturating_pow(exponent).max(1)),
            Backoff::Linear => base_s * f64::from(attempt.max(1)),
        };
        Duration::from_secs_f64(delay_s).min(max)
    }
}
