//! Circuit breaker configuration.

use crate::events::CircuitBreakerEvent;
use reliapi_core::{EventListeners, FnListener};
use std::time::Duration;

/// Configuration for a [`crate::CircuitBreaker`].
pub struct CircuitBreakerConfig {
    pub(crate) failures_to_open: u32,
    pub(crate) open_ttl: Duration,
    pub(crate) event_listeners: EventListeners<CircuitBreakerEvent>,
}

impl CircuitBreakerConfig {
    /// Creates a builder with defaults.
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`CircuitBreakerConfig`].
pub struct CircuitBreakerConfigBuilder {
    failures_to_open: u32,
    open_ttl: Duration,
    event_listeners: EventListeners<CircuitBreakerEvent>,
}

impl Default for CircuitBreakerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerConfigBuilder {
    /// Creates a new builder with defaults.
    ///
    /// Defaults:
    /// - failures_to_open: 5
    /// - open_ttl: 60 seconds
    pub fn new() -> Self {
        Self {
            failures_to_open: 5,
            open_ttl: Duration::from_secs(60),
            event_listeners: EventListeners::new(),
        }
    }

    /// Sets the number of consecutive failures that opens the circuit.
    pub fn failures_to_open(mut self, failures: u32) -> Self {
        self.failures_to_open = failures.max(1);
        self
    }

    /// Sets how long an open circuit stays open before auto-closing.
    pub fn open_ttl(mut self, ttl: Duration) -> Self {
        self.open_ttl = ttl;
        self
    }

    /// Registers a callback for circuit opening.
    ///
    /// Called with the upstream identifier when the failure count reaches
    /// the threshold.
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let CircuitBreakerEvent::Opened { upstream, .. } = event {
                f(upstream);
            }
        }));
        self
    }

    /// Registers a callback for circuit auto-close.
    pub fn on_auto_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let CircuitBreakerEvent::AutoClosed { upstream, .. } = event {
                f(upstream);
            }
        }));
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failures_to_open: self.failures_to_open,
            open_ttl: self.open_ttl,
            event_listeners: self.event_listeners,
        }
    }
}
