//! ReliAPI gateway: a reliability proxy for HTTP and LLM APIs.
//!
//! The gateway sits between callers and upstream APIs and adds caching,
//! idempotent request coalescing, retries with backoff, circuit breaking,
//! token-bucket rate smoothing, provider-key pooling with health
//! tracking, cost budgeting, tenant isolation, and SSE streaming
//! passthrough.
//!
//! Wiring lives in [`state::AppState`]; the HTTP surface in [`routes`];
//! the three request pipelines in [`engine`].

pub mod config;
pub mod engine;
pub mod iplimit;
pub mod metrics;
pub mod overrides;
pub mod profiles;
pub mod routes;
pub mod schemas;
pub mod state;
pub mod upstream;
