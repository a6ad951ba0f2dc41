//! Key pool manager.

use crate::events::KeyPoolEvent;
use crate::key::{KeyErrorKind, KeyStatus, ProviderKey};
#[cfg(feature = "metrics")]
use metrics::counter;
use parking_lot::Mutex;
use reliapi_core::EventListeners;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Sliding window over which a key's QPS is measured.
const QPS_WINDOW: Duration = Duration::from_secs(10);

/// Interval between decay passes.
const DECAY_INTERVAL: Duration = Duration::from_secs(60);

/// Multiplier applied to every key's error score on each decay pass.
const DECAY_FACTOR: f64 = 0.9;

/// Error score below which a degraded key recovers on success.
const RECOVERY_THRESHOLD: f64 = 0.3;

/// Consecutive errors degrading an active key.
const DEGRADE_AT: u32 = 5;

/// Consecutive errors exhausting a degraded key.
const EXHAUST_AT: u32 = 10;

struct Inner {
    pools: HashMap<String, Vec<ProviderKey>>,
    qps_windows: HashMap<String, VecDeque<Instant>>,
}

impl Inner {
    fn find_key_mut(&mut self, key_id: &str) -> Option<&mut ProviderKey> {
        self.pools
            .values_mut()
            .flat_map(|pool| pool.iter_mut())
            .find(|key| key.id == key_id)
    }

    fn update_qps(&mut self, key_id: &str) {
        let now = Instant::now();
        let window = self.qps_windows.entry(key_id.to_string()).or_default();
        while let Some(front) = window.front() {
            if now.duration_since(*front) >= QPS_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        window.push_back(now);
        let qps = window.len() as f64 / QPS_WINDOW.as_secs_f64();
        if let Some(key) = self.find_key_mut(key_id) {
            key.current_qps = qps;
        }
    }
}

/// Health summary of one provider's pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolHealth {
    pub total_keys: usize,
    pub active: usize,
    pub degraded: usize,
    pub exhausted: usize,
    pub banned: usize,
    pub avg_health_score: f64,
    pub avg_error_score: f64,
    pub is_exhausted: bool,
}

/// Manages every provider's key pool.
///
/// All state mutations take the single internal lock; the decay loop
/// contends on the same lock once a minute.
pub struct KeyPoolManager {
    inner: Mutex<Inner>,
    listeners: EventListeners<KeyPoolEvent>,
    shutdown: watch::Sender<bool>,
}

impl KeyPoolManager {
    pub fn new(pools: HashMap<String, Vec<ProviderKey>>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner {
                pools,
                qps_windows: HashMap::new(),
            }),
            listeners: EventListeners::new(),
            shutdown,
        }
    }

    pub fn with_listeners(mut self, listeners: EventListeners<KeyPoolEvent>) -> Self {
        self.listeners = listeners;
        self
    }

    /// Whether the provider has a non-empty pool.
    pub fn has_pool(&self, provider: &str) -> bool {
        self.inner
            .lock()
            .pools
            .get(provider)
            .map(|pool| !pool.is_empty())
            .unwrap_or(false)
    }

    /// Selects the best key for a provider.
    ///
    /// Active keys are preferred; when exclusion leaves none, degraded
    /// keys are considered by the same load-score rule. Ties resolve to
    /// the earliest key in configuration order. Selection stamps
    /// `last_used_at` and feeds the QPS window.
    pub fn select_key(
        &self,
        provider: &str,
        exclude: Option<&HashSet<String>>,
    ) -> Option<ProviderKey> {
        let mut inner = self.inner.lock();
        let pool = inner.pools.get(provider)?;

        let excluded = |key: &ProviderKey| {
            exclude
                .map(|set| set.contains(&key.id))
                .unwrap_or(false)
        };

        let pick_among = |status: KeyStatus| -> Option<String> {
            let mut best: Option<(&ProviderKey, f64)> = None;
            for key in pool.iter().filter(|k| k.status == status && !excluded(k)) {
                // Score degraded keys by their components; load_score()
                // itself pins non-active keys at infinity.
                let qps_share = match key.qps_limit {
                    Some(limit) if limit > 0.0 => key.current_qps / limit,
                    _ => 0.0,
                };
                let score = qps_share + key.recent_error_score;
                match best {
                    Some((_, best_score)) if score >= best_score => {}
                    _ => best = Some((key, score)),
                }
            }
            best.map(|(key, _)| key.id.clone())
        };

        let selected_id = pick_among(KeyStatus::Active).or_else(|| {
            let fallback = pick_among(KeyStatus::Degraded);
            if fallback.is_some() {
                tracing::warn!(provider, "no active keys, falling back to degraded");
            }
            fallback
        });

        let Some(id) = selected_id else {
            tracing::error!(provider, "no available keys (all excluded or exhausted)");
            drop(inner);
            self.listeners.emit(&KeyPoolEvent::PoolExhausted {
                provider: provider.to_string(),
                timestamp: Instant::now(),
            });
            return None;
        };

        if let Some(key) = inner.find_key_mut(&id) {
            key.last_used_at = Instant::now();
        }
        inner.update_qps(&id);
        inner.find_key_mut(&id).cloned()
    }

    /// Records a successful request for a key.
    ///
    /// Resets the consecutive-error count, decays the error score, and
    /// recovers a degraded key whose score has fallen far enough.
    pub fn record_success(&self, key_id: &str) {
        let recovered = {
            let mut inner = self.inner.lock();
            let Some(key) = inner.find_key_mut(key_id) else {
                return;
            };
            key.consecutive_errors = 0;
            key.recent_error_score *= 0.95;
            key.update_health();
            if key.status == KeyStatus::Degraded && key.recent_error_score < RECOVERY_THRESHOLD {
                key.status = KeyStatus::Active;
                Some(key.provider.clone())
            } else {
                None
            }
        };

        #[cfg(feature = "metrics")]
        counter!("reliapi_key_pool_requests_total", "key_id" => key_id.to_string(), "status" => "success")
            .increment(1);

        if let Some(provider) = recovered {
            tracing::info!(key_id, "key recovered to active status");
            self.listeners.emit(&KeyPoolEvent::StatusChanged {
                key_id: key_id.to_string(),
                provider,
                from: KeyStatus::Degraded,
                to: KeyStatus::Active,
                timestamp: Instant::now(),
            });
        }
    }

    /// Records a failed request for a key and applies status transitions.
    pub fn record_error(&self, key_id: &str, kind: KeyErrorKind) {
        let transition = {
            let mut inner = self.inner.lock();
            let Some(key) = inner.find_key_mut(key_id) else {
                return;
            };
            key.consecutive_errors += 1;
            key.recent_error_score = (key.recent_error_score + kind.score_increment()).min(1.0);
            key.update_health();

            let from = key.status;
            let to = match key.status {
                KeyStatus::Active if key.consecutive_errors >= DEGRADE_AT => KeyStatus::Degraded,
                KeyStatus::Degraded if key.consecutive_errors >= EXHAUST_AT => KeyStatus::Exhausted,
                current => current,
            };
            if to != from {
                key.status = to;
                Some((key.provider.clone(), from, to, key.consecutive_errors))
            } else {
                None
            }
        };

        #[cfg(feature = "metrics")]
        counter!("reliapi_key_pool_errors_total", "key_id" => key_id.to_string(), "error_type" => kind.as_str())
            .increment(1);

        if let Some((provider, from, to, errors)) = transition {
            match to {
                KeyStatus::Degraded => {
                    tracing::warn!(key_id, errors, "key degraded after consecutive errors")
                }
                KeyStatus::Exhausted => {
                    tracing::error!(key_id, errors, "key exhausted after consecutive errors")
                }
                _ => {}
            }
            self.listeners.emit(&KeyPoolEvent::StatusChanged {
                key_id: key_id.to_string(),
                provider,
                from,
                to,
                timestamp: Instant::now(),
            });
        }
    }

    /// Number of active keys for a provider.
    pub fn active_key_count(&self, provider: &str) -> usize {
        self.inner
            .lock()
            .pools
            .get(provider)
            .map(|pool| pool.iter().filter(|k| k.status == KeyStatus::Active).count())
            .unwrap_or(0)
    }

    /// Health summary for a provider's pool, if it exists.
    pub fn pool_health(&self, provider: &str) -> Option<PoolHealth> {
        let inner = self.inner.lock();
        let pool = inner.pools.get(provider)?;
        if pool.is_empty() {
            return None;
        }
        let count = |status: KeyStatus| pool.iter().filter(|k| k.status == status).count();
        let active = count(KeyStatus::Active);
        Some(PoolHealth {
            total_keys: pool.len(),
            active,
            degraded: count(KeyStatus::Degraded),
            exhausted: count(KeyStatus::Exhausted),
            banned: count(KeyStatus::Banned),
            avg_health_score: pool.iter().map(|k| k.health_score).sum::<f64>() / pool.len() as f64,
            avg_error_score: pool.iter().map(|k| k.recent_error_score).sum::<f64>()
                / pool.len() as f64,
            is_exhausted: active == 0,
        })
    }

    /// Runs one decay pass over every key.
    pub fn decay_error_scores(&self) {
        let mut inner = self.inner.lock();
        for pool in inner.pools.values_mut() {
            for key in pool.iter_mut() {
                key.recent_error_score *= DECAY_FACTOR;
                key.update_health();
            }
        }
    }

    /// Spawns the background decay loop. The handle completes when
    /// [`KeyPoolManager::shutdown`] is called.
    pub fn spawn_decay_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DECAY_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => manager.decay_error_scores(),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("key pool decay loop stopped");
        })
    }

    /// Signals the decay loop to exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}
