//! Retry policy matrix keyed by error class.

use crate::backoff::Backoff;
use crate::retry_after;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Error classes the matrix distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Upstream returned 429.
    RateLimited,
    /// Upstream returned a 5xx status.
    ServerError,
    /// Connect or transport failure.
    Network,
    /// The request timed out.
    Timeout,
}

impl ErrorClass {
    /// Configuration/metric key for this class.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::RateLimited => "429",
            ErrorClass::ServerError => "5xx",
            ErrorClass::Network => "net",
            ErrorClass::Timeout => "timeout",
        }
    }
}

impl FromStr for ErrorClass {
    type Err = UnknownErrorClass;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "429" => Ok(ErrorClass::RateLimited),
            "5xx" => Ok(ErrorClass::ServerError),
            "net" => Ok(ErrorClass::Network),
            "timeout" => Ok(ErrorClass::Timeout),
            other => Err(UnknownErrorClass(other.to_string())),
        }
    }
}

/// Error for unrecognised matrix keys in configuration.
#[derive(Debug, thiserror::Error)]
#[error("unknown retry error class '{0}' (expected 429, 5xx, net, or timeout)")]
pub struct UnknownErrorClass(pub String);

/// Retry policy for one error class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts for this class, including the first call.
    pub attempts: u32,
    /// Backoff shape between attempts.
    #[serde(default)]
    pub backoff: Backoff,
    /// Base delay.
    #[serde(with = "duration_secs", default = "default_base")]
    pub base: Duration,
    /// Delay ceiling; also caps `Retry-After` values.
    #[serde(with = "duration_secs", default = "default_max")]
    pub max: Duration,
}

fn default_base() -> Duration {
    Duration::from_secs(1)
}

fn default_max() -> Duration {
    Duration::from_secs(60)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if secs < 0.0 || !secs.is_finite() {
            return Err(serde::de::Error::custom("delay seconds must be finite and non-negative"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::ExpJitter,
            base: default_base(),
            max: default_max(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based).
    ///
    /// An upstream-provided `Retry-After` wins over the configured shape,
    /// capped at `max`.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(retry_after) = retry_after {
            return retry_after.min(self.max);
        }
        self.backoff.delay(attempt, self.base, self.max)
    }

    /// Parses a raw `Retry-After` header value and applies the cap.
    pub fn delay_from_header(&self, attempt: u32, header: Option<&str>) -> Duration {
        let parsed = header.and_then(retry_after::parse);
        self.delay(attempt, parsed)
    }
}

/// Policy matrix keyed by error class.
#[derive(Debug, Clone)]
pub struct RetryMatrix {
    policies: HashMap<ErrorClass, RetryPolicy>,
}

impl RetryMatrix {
    /// A matrix with no policies: nothing is retried.
    pub fn empty() -> Self {
        Self {
            policies: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, class: ErrorClass, policy: RetryPolicy) -> Self {
        self.policies.insert(class, policy);
        self
    }

    pub fn policy(&self, class: ErrorClass) -> Option<&RetryPolicy> {
        self.policies.get(&class)
    }
}

impl Default for RetryMatrix {
    /// Matches the stock policy set: three attempts on 429, two on 5xx,
    /// network, and timeout, all exponential with jitter from one second.
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            ErrorClass::RateLimited,
            RetryPolicy {
                attempts: 3,
                ..RetryPolicy::default()
            },
        );
        for class in [ErrorClass::ServerError, ErrorClass::Network, ErrorClass::Timeout] {
            policies.insert(
                class,
                RetryPolicy {
                    attempts: 2,
                    ..RetryPolicy::default()
                },
            );
        }
        Self { policies }
    }
}
