//! Scheduler over the bucket map.

use crate::bucket::TokenBucket;
use crate::{BUCKET_TTL, CLEANUP_INTERVAL, MAX_BUCKETS};
use lru::LruCache;
#[cfg(feature = "metrics")]
use metrics::counter;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};

/// The bucket class that refused an admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    ProviderKey,
    Tenant,
    Profile,
}

impl BucketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketKind::ProviderKey => "provider_key",
            BucketKind::Tenant => "tenant",
            BucketKind::Profile => "profile",
        }
    }

    fn bucket_key(&self, name: &str) -> String {
        format!("{}:{name}", self.as_str())
    }

    fn default_max_concurrent(&self) -> u32 {
        match self {
            BucketKind::ProviderKey => 5,
            BucketKind::Tenant | BucketKind::Profile => 10,
        }
    }
}

/// An admission attempt: up to one (name, qps) pair per bucket class,
/// consumed in provider-key, tenant, profile order.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmissionRequest<'a> {
    pub provider_key: Option<(&'a str, f64)>,
    pub tenant: Option<(&'a str, f64)>,
    pub profile: Option<(&'a str, f64)>,
}

impl<'a> AdmissionRequest<'a> {
    fn checks(&self) -> impl Iterator<Item = (BucketKind, &'a str, f64)> {
        [
            self.provider_key.map(|(n, q)| (BucketKind::ProviderKey, n, q)),
            self.tenant.map(|(n, q)| (BucketKind::Tenant, n, q)),
            self.profile.map(|(n, q)| (BucketKind::Profile, n, q)),
        ]
        .into_iter()
        .flatten()
    }
}

/// A refused admission.
#[derive(Debug, Clone, Copy)]
pub struct Rejection {
    /// Estimated wait until the refusing bucket would admit one request.
    pub retry_after: Duration,
    /// Which bucket class refused.
    pub bucket: BucketKind,
}

/// Live bucket counts by class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketStats {
    pub total: usize,
    pub provider_key: usize,
    pub tenant: usize,
    pub profile: usize,
}

/// Concurrency permits held for one request.
///
/// Dropping the guard releases every acquired semaphore, so permits are
/// returned on success, error, and panic paths alike.
pub struct SlotGuard {
    permits: Vec<OwnedSemaphorePermit>,
}

impl SlotGuard {
    /// Number of semaphores held.
    pub fn held(&self) -> usize {
        self.permits.len()
    }
}

/// Rate scheduler managing token buckets with LRU+TTL lifecycle.
pub struct RateScheduler {
    buckets: Mutex<LruCache<String, TokenBucket>>,
    bucket_ttl: Duration,
    cleanup_interval: Duration,
    shutdown: watch::Sender<bool>,
}

impl RateScheduler {
    pub fn new() -> Self {
        Self::with_limits(MAX_BUCKETS, BUCKET_TTL, CLEANUP_INTERVAL)
    }

    pub fn with_limits(
        max_buckets: usize,
        bucket_ttl: Duration,
        cleanup_interval: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(max_buckets)
            .unwrap_or_else(|| NonZeroUsize::new(MAX_BUCKETS).expect("MAX_BUCKETS is non-zero"));
        let (shutdown, _) = watch::channel(false);
        Self {
            buckets: Mutex::new(LruCache::new(capacity)),
            bucket_ttl,
            cleanup_interval,
            shutdown,
        }
    }

    /// Consumes one token from each applicable bucket, in order.
    ///
    /// Buckets are created lazily with `burst = 2 × max_qps` and the
    /// class's default concurrency. The first bucket without a token
    /// refuses the admission; earlier buckets keep their consumed token,
    /// which is the token-bucket equivalent of the request having been
    /// scheduled and then dropped.
    pub async fn check_rate_limit(&self, request: AdmissionRequest<'_>) -> Result<(), Rejection> {
        let mut buckets = self.buckets.lock().await;
        for (kind, name, qps) in request.checks() {
            if qps <= 0.0 {
                continue;
            }
            let key = kind.bucket_key(name);
            if buckets.get(&key).is_none() {
                let bucket = TokenBucket::new(qps, (qps * 2.0) as u32, kind.default_max_concurrent());
                if let Some((evicted_key, _)) = buckets.push(key.clone(), bucket) {
                    if evicted_key != key {
                        tracing::debug!(bucket = %evicted_key, "evicted lru bucket");
                        #[cfg(feature = "metrics")]
                        counter!("reliapi_scheduler_evictions_total").increment(1);
                    }
                }
            }
            let bucket = buckets
                .get_mut(&key)
                .expect("bucket exists after insertion");
            if !bucket.consume(1.0) {
                let retry_after = bucket.retry_after();
                #[cfg(feature = "metrics")]
                counter!("reliapi_rate_limited_total", "bucket" => kind.as_str()).increment(1);
                return Err(Rejection { retry_after, bucket: kind });
            }
        }
        Ok(())
    }

    /// Acquires the concurrency semaphore of every applicable bucket that
    /// already exists. The returned guard releases them all on drop.
    pub async fn acquire_slots(&self, request: AdmissionRequest<'_>) -> SlotGuard {
        let semaphores: Vec<Arc<Semaphore>> = {
            let mut buckets = self.buckets.lock().await;
            request
                .checks()
                .filter_map(|(kind, name, _)| {
                    buckets.get(&kind.bucket_key(name)).map(|b| b.semaphore())
                })
                .collect()
        };

        let mut permits = Vec::with_capacity(semaphores.len());
        for semaphore in semaphores {
            match semaphore.acquire_owned().await {
                Ok(permit) => permits.push(permit),
                // A closed semaphore only happens at shutdown; dropping
                // the partial set releases everything acquired so far.
                Err(_) => break,
            }
        }
        SlotGuard { permits }
    }

    /// Removes buckets idle longer than the TTL. Returns how many were
    /// removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let expired: Vec<String> = buckets
            .iter()
            .filter(|(_, b)| now.duration_since(b.last_accessed) > self.bucket_ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            buckets.pop(key);
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "removed expired rate-limit buckets");
            #[cfg(feature = "metrics")]
            counter!("reliapi_scheduler_expired_total").increment(expired.len() as u64);
        }
        expired.len()
    }

    /// Live bucket counts by class.
    pub async fn stats(&self) -> BucketStats {
        let buckets = self.buckets.lock().await;
        let mut stats = BucketStats {
            total: buckets.len(),
            ..Default::default()
        };
        for (key, _) in buckets.iter() {
            if key.starts_with("provider_key:") {
                stats.provider_key += 1;
            } else if key.starts_with("tenant:") {
                stats.tenant += 1;
            } else if key.starts_with("profile:") {
                stats.profile += 1;
            }
        }
        stats
    }

    /// Spawns the background sweeper. The handle completes when
    /// [`RateScheduler::shutdown`] is called.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.cleanup_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        scheduler.sweep_expired().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("rate scheduler sweeper stopped");
        })
    }

    /// Signals the sweeper to exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Default for RateScheduler {
    fn default() -> Self {
        Self::new()
    }
}
