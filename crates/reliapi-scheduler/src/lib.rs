//! Token-bucket rate scheduler.
//!
//! Buckets are keyed by a type prefix (`provider_key:<id>`,
//! `tenant:<name>`, `profile:<name>`) and created lazily on first
//! reference. Admission consumes one token from each applicable bucket in
//! order; the first refusal fails the admission with a `retry_after`
//! estimate and the refusing bucket's label.
//!
//! The bucket map is LRU-ordered and bounded at [`MAX_BUCKETS`]; a
//! background sweeper removes buckets idle longer than the TTL.
//! Per-bucket semaphores gate request concurrency; permits release on
//! every exit path via RAII.

mod bucket;
mod scheduler;

pub use bucket::TokenBucket;
pub use scheduler::{
    AdmissionRequest, BucketKind, BucketStats, RateScheduler, Rejection, SlotGuard,
};

/// Bound on the total number of live buckets.
pub const MAX_BUCKETS: usize = 1000;

/// Idle time after which the sweeper removes a bucket.
pub const BUCKET_TTL: std::time::Duration = std::time::Duration::from_secs(3600);

/// Interval between sweeper passes.
pub const CLEANUP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);
