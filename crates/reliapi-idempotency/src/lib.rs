//! Idempotency keys and single-flight coalescing.
//!
//! Concurrent requests sharing an idempotency key and an identical request
//! hash collapse into one upstream call. The winner of an atomic
//! `SET`-if-absent registration dispatches; everyone else either replays
//! the stored result, polls for it while an in-progress marker is live, or
//! is rejected when the hashes differ.
//!
//! Three KV keys per idempotency key, all tenant-namespaced:
//!
//! - `idempotency:<key>`: the registration record (request id, request
//!   hash, creation time), TTL [`REGISTRATION_TTL`].
//! - `idempotency_in_progress:<key>`: short-lived marker set by the
//!   winner just before upstream dispatch, TTL [`IN_PROGRESS_TTL`].
//! - `idempotency_result:<key>`: the final result, TTL equal to the
//!   target's cache TTL.
//!
//! Store unavailability degrades every operation: registration reports a
//! fresh request and duplicates may reach the upstream, which is the
//! documented trade-off.

use reliapi_store::KvStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// TTL of the registration record.
pub const REGISTRATION_TTL: Duration = Duration::from_secs(3600);

/// TTL of the in-progress marker.
pub const IN_PROGRESS_TTL: Duration = Duration::from_secs(300);

/// Upper bound a waiter spends polling for another request's result.
pub const COALESCE_WAIT_BUDGET: Duration = Duration::from_secs(30);

const POLL_INITIAL: Duration = Duration::from_millis(50);
const POLL_MAX: Duration = Duration::from_millis(500);

/// How long a waiter keeps polling before it has ever observed the
/// in-progress marker. Covers the winner's gap between registration and
/// marking.
const MARKER_GRACE: Duration = Duration::from_millis(500);

/// Stored registration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub request_id: String,
    pub request_hash: String,
    pub created_at: u64,
}

/// Outcome of registering an idempotency key.
#[derive(Debug, Clone)]
pub enum Registration {
    /// This request won the registration and should dispatch upstream.
    New,
    /// The key is already registered with a matching request hash.
    Existing { request_id: String },
    /// The key is registered with a different request hash.
    Conflict { existing_request_id: String },
}

/// Computes the stable hash identifying a request.
///
/// SHA-256 over canonical JSON of `{method, url, sorted headers,
/// body_hash}`. Side-effect free and invariant under header ordering.
pub fn request_hash(
    method: &str,
    url: &str,
    headers: Option<&HashMap<String, String>>,
    body: Option<&[u8]>,
) -> String {
    let mut key_data = json!({
        "method": method.to_ascii_uppercase(),
        "url": url,
        "headers": headers.cloned().unwrap_or_default(),
    });
    if let Some(body) = body {
        if !body.is_empty() {
            let mut hasher = Sha256::new();
            hasher.update(body);
            key_data["body_hash"] = Value::String(hex(&hasher.finalize()));
        }
    }
    let canonical = serde_json::to_string(&key_data).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Manages idempotency registrations, in-progress markers, and results.
#[derive(Clone)]
pub struct IdempotencyManager {
    store: Arc<dyn KvStore>,
    key_prefix: String,
}

impl IdempotencyManager {
    pub fn new(store: Arc<dyn KvStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    fn namespaced(&self, kind: &str, idempotency_key: &str, tenant: Option<&str>) -> String {
        match tenant {
            Some(tenant) => format!(
                "{}:tenant:{tenant}:{kind}:{idempotency_key}",
                self.key_prefix
            ),
            None => format!("{}:{kind}:{idempotency_key}", self.key_prefix),
        }
    }

    /// Registers an idempotency key for a request.
    ///
    /// Reads first to detect hash conflicts cheaply, then races an atomic
    /// `SET`-if-absent. A lost race is resolved by re-reading; if the
    /// record vanished in between (expiry or manual delete), the request
    /// is treated as new.
    pub async fn register(
        &self,
        idempotency_key: &str,
        request_hash: &str,
        request_id: &str,
        tenant: Option<&str>,
    ) -> Registration {
        let key = self.namespaced("idempotency", idempotency_key, tenant);

        if let Some(existing) = self.read_record(&key).await {
            return Self::classify(existing, request_hash);
        }

        let record = IdempotencyRecord {
            request_id: request_id.to_string(),
            request_hash: request_hash.to_string(),
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        let raw = match serde_json::to_string(&record) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "idempotency record not serialisable");
                return Registration::New;
            }
        };

        match self.store.set_if_absent(&key, &raw, REGISTRATION_TTL).await {
            Ok(true) => Registration::New,
            Ok(false) => match self.read_record(&key).await {
                Some(existing) => Self::classify(existing, request_hash),
                // Deleted between SET and GET; rare, treat as new.
                None => Registration::New,
            },
            Err(err) => {
                tracing::warn!(error = %err, "idempotency register degraded to pass-through");
                Registration::New
            }
        }
    }

    fn classify(existing: IdempotencyRecord, request_hash: &str) -> Registration {
        if existing.request_hash == request_hash {
            Registration::Existing {
                request_id: existing.request_id,
            }
        } else {
            Registration::Conflict {
                existing_request_id: existing.request_id,
            }
        }
    }

    async fn read_record(&self, key: &str) -> Option<IdempotencyRecord> {
        let raw = match self.store.get(key).await {
            Ok(raw) => raw?,
            Err(err) => {
                tracing::warn!(error = %err, "idempotency read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!(error = %err, key = %key, "corrupt idempotency record, deleting");
                if let Err(err) = self.store.delete(key).await {
                    tracing::warn!(error = %err, "failed to delete corrupt idempotency record");
                }
                None
            }
        }
    }

    /// Fetches the stored result for a completed request, if any.
    pub async fn result(&self, idempotency_key: &str, tenant: Option<&str>) -> Option<Value> {
        let key = self.namespaced("idempotency_result", idempotency_key, tenant);
        let raw = match self.store.get(&key).await {
            Ok(raw) => raw?,
            Err(err) => {
                tracing::warn!(error = %err, "idempotency result read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(error = %err, key = %key, "corrupt idempotency result, deleting");
                if let Err(err) = self.store.delete(&key).await {
                    tracing::warn!(error = %err, "failed to delete corrupt idempotency result");
                }
                None
            }
        }
    }

    /// Stores the final result of a completed request.
    pub async fn store_result(
        &self,
        idempotency_key: &str,
        result: &Value,
        ttl: Duration,
        tenant: Option<&str>,
    ) {
        let key = self.namespaced("idempotency_result", idempotency_key, tenant);
        let raw = match serde_json::to_string(result) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "idempotency result not serialisable, skipping");
                return;
            }
        };
        if let Err(err) = self.store.set(&key, &raw, ttl).await {
            tracing::warn!(error = %err, "idempotency result store failed");
        }
    }

    /// Whether a request with this key is currently in flight.
    pub async fn in_progress(&self, idempotency_key: &str, tenant: Option<&str>) -> bool {
        let key = self.namespaced("idempotency_in_progress", idempotency_key, tenant);
        match self.store.exists(&key).await {
            Ok(exists) => exists,
            Err(err) => {
                tracing::warn!(error = %err, "idempotency in-progress check failed");
                false
            }
        }
    }

    /// Marks the request as in flight, just before upstream dispatch.
    pub async fn mark_in_progress(&self, idempotency_key: &str, tenant: Option<&str>) {
        let key = self.namespaced("idempotency_in_progress", idempotency_key, tenant);
        if let Err(err) = self.store.set(&key, "1", IN_PROGRESS_TTL).await {
            tracing::warn!(error = %err, "idempotency mark in-progress failed");
        }
    }

    /// Clears the in-flight marker on completion, success or failure.
    pub async fn clear_in_progress(&self, idempotency_key: &str, tenant: Option<&str>) {
        let key = self.namespaced("idempotency_in_progress", idempotency_key, tenant);
        if let Err(err) = self.store.delete(&key).await {
            tracing::warn!(error = %err, "idempotency clear in-progress failed");
        }
    }

    /// Polls for the winner's result while it is in flight.
    ///
    /// Backs off exponentially from 50 ms to a 500 ms cap, for at most
    /// [`COALESCE_WAIT_BUDGET`]. The marker is allowed [`MARKER_GRACE`]
    /// to appear, since the winner registers before it marks. Returns
    /// `None` when the wait expires or the marker disappears without a
    /// result; the caller must not dispatch upstream in that case.
    pub async fn wait_for_result(
        &self,
        idempotency_key: &str,
        tenant: Option<&str>,
    ) -> Option<Value> {
        let mut waited = Duration::ZERO;
        let mut interval = POLL_INITIAL;
        let mut saw_marker = false;
        loop {
            if let Some(result) = self.result(idempotency_key, tenant).await {
                return Some(result);
            }
            if self.in_progress(idempotency_key, tenant).await {
                saw_marker = true;
            } else if saw_marker || waited >= MARKER_GRACE {
                // The winner finished (result read happens first next
                // iteration) or died; either way there is nothing to
                // wait on.
                return self.result(idempotency_key, tenant).await;
            }
            if waited >= COALESCE_WAIT_BUDGET {
                return None;
            }
            tokio::time::sleep(interval).await;
            waited += interval;
            interval = (interval.mul_f64(1.5)).min(POLL_MAX);
        }
    }
}
