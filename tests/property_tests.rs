//! Property-based tests for the gateway's coordination primitives.
//!
//! Run with: cargo test --test property_tests
//!
//! These tests use proptest to generate random inputs and verify that
//! the core invariants hold: fingerprint canonicalisation, token-bucket
//! conservation, request-hash stability, and retry-delay bounds.

mod property;
