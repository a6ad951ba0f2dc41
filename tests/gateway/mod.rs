//! Pipeline tests: each module exercises one reliability concern end to
//! end through the proxy engine, with wiremock standing in for the
//! upstream.

pub mod common;

mod budget;
mod cache;
mod fallback;
mod idempotency;
mod keypool;
mod scheduler;
mod streaming;
mod tenancy;
