//! `Retry-After` header parsing.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Parses a `Retry-After` value.
///
/// Accepts both forms RFC 9110 allows: a non-negative integer number of
/// seconds, or an HTTP-date. A date in the past yields a zero delay. On
/// parse failure the caller falls through to its configured backoff.
pub fn parse(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(secs) = value.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(Duration::from_secs_f64(secs));
        }
        return None;
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&Utc) - Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
