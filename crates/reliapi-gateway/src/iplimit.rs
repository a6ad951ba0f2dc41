//! Per-IP sliding-log limiter for the health probes.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Sliding-log rate limiter keyed by source IP.
///
/// Stores request timestamps per IP and counts those within the window;
/// precise, with memory proportional to the limit per active IP.
pub struct ProbeRateLimiter {
    limit: usize,
    window: Duration,
    log: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl ProbeRateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            log: Mutex::new(HashMap::new()),
        }
    }

    /// Records one request and returns whether it is admitted.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut log = self.log.lock();
        let entry = log.entry(ip).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) >= self.window {
                entry.pop_front();
            } else {
                break;
            }
        }
        if entry.len() >= self.limit {
            return false;
        }
        entry.push_back(now);
        true
    }
}

impl Default for ProbeRateLimiter {
    /// 20 requests per minute per source IP.
    fn default() -> Self {
        Self::new(20, Duration::from_secs(60))
    }
}
