//! In-memory store backend.

use crate::{KvStore, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Process-local [`KvStore`] backend with TTL semantics.
///
/// Expired entries are dropped lazily on access and opportunistically on
/// writes. Suitable for tests and for running the gateway without Redis;
/// idempotency and cache scope shrink to the single process in that mode.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(entries: &mut HashMap<String, Entry>, now: Instant) {
        entries.retain(|_, e| !e.is_expired(now));
    }

    /// Matches the glob subset Redis `KEYS` supports that the gateway
    /// actually uses: literal text and `*` wildcards.
    fn glob_match(pattern: &str, key: &str) -> bool {
        let parts: Vec<&str> = pattern.split('*').collect();
        if parts.len() == 1 {
            return pattern == key;
        }
        let mut rest = key;
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            match rest.find(part) {
                Some(pos) => {
                    // The first segment must anchor at the start.
                    if i == 0 && pos != 0 {
                        return false;
                    }
                    rest = &rest[pos + part.len()..];
                }
                None => return false,
            }
        }
        // The last segment must anchor at the end unless the pattern ends
        // with a wildcard.
        if let Some(last) = parts.last() {
            if !last.is_empty() && !pattern.ends_with('*') && !key.ends_with(last) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::prune(&mut entries, now);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let live = entries.get(key).map(|e| !e.is_expired(now)).unwrap_or(false);
        if live {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(false)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let current = match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => entry
                .value
                .parse::<i64>()
                .map_err(|e| StoreError::Operation(format!("INCR on non-integer value: {e}")))?,
            _ => 0,
        };
        let next = current + 1;
        let expires_at = entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.expires_at)
            // Counters without an explicit EXPIRE live long enough for any
            // window the gateway tracks.
            .unwrap_or(now + Duration::from_secs(24 * 3600));
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::prune(&mut entries, now);
        Ok(entries
            .keys()
            .filter(|k| Self::glob_match(pattern, k))
            .cloned()
            .collect())
    }
}
