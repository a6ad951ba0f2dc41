//! Core infrastructure shared by the ReliAPI gateway crates.
//!
//! This crate holds the pieces every other crate agrees on:
//!
//! - [`ErrorCode`]: the closed set of error codes used in responses, logs,
//!   and metrics. Nothing outside this set ever reaches a caller.
//! - [`ErrorKind`]: the coarse error classification that drives retryability
//!   and the `type` field of the error envelope.
//! - [`UpstreamStatus`]: bounded-cardinality normalisation of upstream HTTP
//!   status codes, used **only** as a metric label. Actual status codes are
//!   preserved in logs and response detail.
//! - [`events`]: a small listener registry the stateful primitives (circuit
//!   breaker, key pool, scheduler) use for observability callbacks.

pub mod errors;
pub mod events;
pub mod status;

pub use errors::{ErrorCode, ErrorKind};
pub use events::{EventListener, EventListeners, FnListener, GatewayEvent};
pub use status::UpstreamStatus;
