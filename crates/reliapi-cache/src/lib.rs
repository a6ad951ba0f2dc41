//! TTL response cache keyed by request fingerprint.
//!
//! Cacheable methods are GET and HEAD by default; POST is admitted only
//! when the caller sets `allow_post` (the LLM path, which keys on the
//! canonical provider payload). Entries are namespaced per tenant so two
//! tenants can never observe each other's responses.
//!
//! The cache is strictly best-effort: store failures are logged and
//! swallowed, corrupt entries are deleted and treated as misses.

mod fingerprint;

pub use fingerprint::{fingerprint, RequestParts};

use reliapi_store::KvStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Default TTL applied when neither the request nor the target overrides
/// it.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Request-fingerprint response cache, tenant-namespaced.
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn KvStore>,
    key_prefix: String,
}

impl Cache {
    pub fn new(store: Arc<dyn KvStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    fn cacheable(method: &str, allow_post: bool) -> bool {
        let method = method.to_ascii_uppercase();
        matches!(method.as_str(), "GET" | "HEAD") || (allow_post && method == "POST")
    }

    fn entry_key(&self, parts: RequestParts<'_>, tenant: Option<&str>) -> String {
        let hash = fingerprint(parts);
        match tenant {
            Some(tenant) => format!("{}:tenant:{tenant}:cache:{hash}", self.key_prefix),
            None => format!("{}:cache:{hash}", self.key_prefix),
        }
    }

    /// Looks up a cached response.
    ///
    /// Returns `None` on a miss, on a non-cacheable method, on a corrupt
    /// entry (which is deleted), and on store failure.
    pub async fn get(
        &self,
        parts: RequestParts<'_>,
        allow_post: bool,
        tenant: Option<&str>,
    ) -> Option<Value> {
        if !Self::cacheable(parts.method, allow_post) {
            return None;
        }
        let key = self.entry_key(parts, tenant);
        let raw = match self.store.get(&key).await {
            Ok(raw) => raw?,
            Err(err) => {
                tracing::warn!(error = %err, "cache get failed, treating as miss");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(error = %err, key = %key, "corrupt cache entry, deleting");
                if let Err(err) = self.store.delete(&key).await {
                    tracing::warn!(error = %err, "failed to delete corrupt cache entry");
                }
                None
            }
        }
    }

    /// Stores a response under the request's fingerprint.
    ///
    /// Failures are logged and swallowed; the caller proceeds as if the
    /// write had happened.
    pub async fn set(
        &self,
        parts: RequestParts<'_>,
        value: &Value,
        ttl: Duration,
        allow_post: bool,
        tenant: Option<&str>,
    ) {
        if !Self::cacheable(parts.method, allow_post) {
            return;
        }
        let key = self.entry_key(parts, tenant);
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "cache entry not serialisable, skipping");
                return;
            }
        };
        if let Err(err) = self.store.set(&key, &raw, ttl).await {
            tracing::warn!(error = %err, "cache set failed, continuing without cache");
        }
    }

    /// Removes all entries whose fingerprint matches `pattern` (glob)
    /// across all tenants.
    pub async fn invalidate(&self, pattern: &str) {
        let full = format!("{}:*cache:{pattern}*", self.key_prefix);
        let keys = match self.store.keys(&full).await {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!(error = %err, "cache invalidate scan failed");
                return;
            }
        };
        for key in keys {
            if let Err(err) = self.store.delete(&key).await {
                tracing::warn!(error = %err, key = %key, "cache invalidate delete failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reliapi_store::MemoryStore;
    use serde_json::json;

    fn cache() -> Cache {
        Cache::new(Arc::new(MemoryStore::new()), "reliapi")
    }

    fn get_parts<'a>() -> RequestParts<'a> {
        RequestParts {
            method: "GET",
            url: "https://api.example.com/posts/1",
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn get_roundtrip() {
        let cache = cache();
        let value = json!({"status_code": 200, "body": {"id": 1}});
        cache
            .set(get_parts(), &value, Duration::from_secs(300), false, None)
            .await;
        assert_eq!(cache.get(get_parts(), false, None).await, Some(value));
    }

    #[tokio::test]
    async fn post_requires_allow_post() {
        let cache = cache();
        let parts = RequestParts {
            method: "POST",
            url: "https://api.example.com/chat",
            body: Some(b"{\"model\":\"gpt-4o\"}"),
            ..Default::default()
        };
        let value = json!({"body": {"content": "hi"}});

        cache
            .set(parts, &value, Duration::from_secs(300), false, None)
            .await;
        assert_eq!(cache.get(parts, true, None).await, None);

        cache
            .set(parts, &value, Duration::from_secs(300), true, None)
            .await;
        assert_eq!(cache.get(parts, true, None).await, Some(value));
        // Without allow_post the same entry is invisible.
        assert_eq!(cache.get(parts, false, None).await, None);
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let cache = cache();
        let value = json!({"body": "tenant-a data"});
        cache
            .set(
                get_parts(),
                &value,
                Duration::from_secs(300),
                false,
                Some("tenant-a"),
            )
            .await;

        assert_eq!(
            cache.get(get_parts(), false, Some("tenant-a")).await,
            Some(value)
        );
        assert_eq!(cache.get(get_parts(), false, Some("tenant-b")).await, None);
        assert_eq!(cache.get(get_parts(), false, None).await, None);
    }

    #[tokio::test]
    async fn corrupt_entries_are_deleted_and_miss() {
        let store = Arc::new(MemoryStore::new());
        let cache = Cache::new(store.clone(), "reliapi");
        let key = cache.entry_key(get_parts(), None);
        store
            .set(&key, "{not json", Duration::from_secs(300))
            .await
            .unwrap();

        assert_eq!(cache.get(get_parts(), false, None).await, None);
        // The corrupt entry is gone.
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalidate_clears_matching_entries_across_tenants() {
        let cache = cache();
        let value = json!({"body": 1});
        cache
            .set(get_parts(), &value, Duration::from_secs(300), false, None)
            .await;
        cache
            .set(
                get_parts(),
                &value,
                Duration::from_secs(300),
                false,
                Some("tenant-a"),
            )
            .await;

        cache.invalidate("").await;
        assert_eq!(cache.get(get_parts(), false, None).await, None);
        assert_eq!(cache.get(get_parts(), false, Some("tenant-a")).await, None);
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = cache();
        let value = json!({"body": 1});
        cache
            .set(get_parts(), &value, Duration::from_millis(10), false, None)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get(get_parts(), false, None).await, None);
    }
}
