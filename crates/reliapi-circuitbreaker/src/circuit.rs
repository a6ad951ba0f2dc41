//! Circuit breaker state machine.

use crate::config::CircuitBreakerConfig;
use crate::events::CircuitBreakerEvent;
#[cfg(feature = "metrics")]
use metrics::counter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;

/// Observable state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// No recent failures; calls are allowed.
    Closed,
    /// Failures recorded but below threshold; calls are allowed.
    HalfOpen,
    /// Threshold reached; calls are rejected until the TTL elapses.
    Open,
}

impl CircuitState {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half-open",
            CircuitState::Open => "open",
        }
    }
}

#[derive(Default)]
struct UpstreamState {
    failures: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker tracking any number of upstreams.
///
/// All operations take a single short critical section so concurrent
/// observers agree on counter and open-mark updates.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    upstreams: Mutex<HashMap<String, UpstreamState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            upstreams: Mutex::new(HashMap::new()),
        }
    }

    /// Resets the upstream's failure count and clears any open mark.
    pub fn record_success(&self, upstream: &str) {
        {
            let mut upstreams = self.upstreams.lock();
            let state = upstreams.entry(upstream.to_string()).or_default();
            state.failures = 0;
            state.opened_at = None;
        }
        self.config
            .event_listeners
            .emit(&CircuitBreakerEvent::SuccessRecorded {
                upstream: upstream.to_string(),
                timestamp: Instant::now(),
            });
    }

    /// Records a failure; opens the circuit at the threshold.
    pub fn record_failure(&self, upstream: &str) {
        let (failures, opened) = {
            let mut upstreams = self.upstreams.lock();
            let state = upstreams.entry(upstream.to_string()).or_default();
            state.failures += 1;
            let opened = state.failures >= self.config.failures_to_open && state.opened_at.is_none();
            if opened {
                state.opened_at = Some(Instant::now());
            }
            (state.failures, opened)
        };

        self.config
            .event_listeners
            .emit(&CircuitBreakerEvent::FailureRecorded {
                upstream: upstream.to_string(),
                timestamp: Instant::now(),
                failures,
            });

        if opened {
            tracing::warn!(upstream, failures, "circuit opened");
            self.config
                .event_listeners
                .emit(&CircuitBreakerEvent::Opened {
                    upstream: upstream.to_string(),
                    timestamp: Instant::now(),
                });
            #[cfg(feature = "metrics")]
            counter!(
                "reliapi_circuit_transitions_total",
                "upstream" => upstream.to_string(),
                "state" => "open"
            )
            .increment(1);
        }
    }

    /// Whether calls to the upstream are currently rejected.
    ///
    /// Auto-closes the circuit, resetting the counter, once the open TTL
    /// has elapsed.
    pub fn is_open(&self, upstream: &str) -> bool {
        let auto_closed = {
            let mut upstreams = self.upstreams.lock();
            let Some(state) = upstreams.get_mut(upstream) else {
                return false;
            };
            match state.opened_at {
                None => return false,
                Some(opened_at) if opened_at.elapsed() >= self.config.open_ttl => {
                    state.failures = 0;
                    state.opened_at = None;
                    true
                }
                Some(_) => return true,
            }
        };

        if auto_closed {
            tracing::info!(upstream, "circuit auto-closed after ttl");
            self.config
                .event_listeners
                .emit(&CircuitBreakerEvent::AutoClosed {
                    upstream: upstream.to_string(),
                    timestamp: Instant::now(),
                });
            #[cfg(feature = "metrics")]
            counter!(
                "reliapi_circuit_transitions_total",
                "upstream" => upstream.to_string(),
                "state" => "closed"
            )
            .increment(1);
        }
        false
    }

    /// Current state label for observability.
    pub fn state(&self, upstream: &str) -> CircuitState {
        let mut upstreams = self.upstreams.lock();
        let Some(state) = upstreams.get_mut(upstream) else {
            return CircuitState::Closed;
        };
        if let Some(opened_at) = state.opened_at {
            if opened_at.elapsed() >= self.config.open_ttl {
                state.failures = 0;
                state.opened_at = None;
            } else {
                return CircuitState::Open;
            }
        }
        if state.failures > 0 {
            CircuitState::HalfOpen
        } else {
            CircuitState::Closed
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
