//! Circuit breaker events.

use reliapi_core::GatewayEvent;
use std::time::Instant;

/// Events emitted by the circuit breaker.
#[derive(Debug, Clone)]
pub enum CircuitBreakerEvent {
    /// A failure was recorded for an upstream.
    FailureRecorded {
        upstream: String,
        timestamp: Instant,
        failures: u32,
    },
    /// A success was recorded, resetting the upstream's counter.
    SuccessRecorded { upstream: String, timestamp: Instant },
    /// The failure threshold was reached and the circuit opened.
    Opened { upstream: String, timestamp: Instant },
    /// The open TTL elapsed and the circuit closed again.
    AutoClosed { upstream: String, timestamp: Instant },
}

impl GatewayEvent for CircuitBreakerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CircuitBreakerEvent::FailureRecorded { .. } => "failure_recorded",
            CircuitBreakerEvent::SuccessRecorded { .. } => "success_recorded",
            CircuitBreakerEvent::Opened { .. } => "opened",
            CircuitBreakerEvent::AutoClosed { .. } => "auto_closed",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            CircuitBreakerEvent::FailureRecorded { timestamp, .. }
            | CircuitBreakerEvent::SuccessRecorded { timestamp, .. }
            | CircuitBreakerEvent::Opened { timestamp, .. }
            | CircuitBreakerEvent::AutoClosed { timestamp, .. } => *timestamp,
        }
    }
}
