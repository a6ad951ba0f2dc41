//! Integration-test package for the reliapi workspace.
//!
//! The crates under `crates/` carry their own unit tests; this package
//! exists to host the cross-crate pipeline and property tests under
//! `tests/`.
