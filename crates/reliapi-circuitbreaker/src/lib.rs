//! Circuit breaker keyed by upstream identifier.
//!
//! One [`CircuitBreaker`] instance tracks every upstream the gateway talks
//! to; state is a failure counter plus the timestamp of the transition to
//! open. The circuit auto-closes once the configured TTL has elapsed,
//! without a half-open probe phase: the counter simply resets and traffic
//! resumes.
//!
//! ```
//! use reliapi_circuitbreaker::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::builder()
//!     .failures_to_open(3)
//!     .open_ttl(std::time::Duration::from_secs(60))
//!     .build());
//!
//! breaker.record_failure("https://api.example.com");
//! assert!(!breaker.is_open("https://api.example.com"));
//! ```

mod circuit;
mod config;
mod events;

pub use circuit::{CircuitBreaker, CircuitState};
pub use config::{CircuitBreakerConfig, CircuitBreakerConfigBuilder};
pub use events::CircuitBreakerEvent;
