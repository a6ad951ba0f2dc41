//! Application state.
//!
//! One explicit value owns every shared component: targets and their
//! upstream clients, the cache, the idempotency manager, per-target
//! circuit breakers, the key pool, the rate scheduler, and the client
//! profiles. Request handlers borrow it; background loops hang off it
//! and are cancelled at shutdown.

use crate::config::GatewayConfig;
use crate::iplimit::ProbeRateLimiter;
use crate::profiles::ClientProfileManager;
use crate::upstream::UpstreamClient;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use reliapi_cache::Cache;
use reliapi_circuitbreaker::{CircuitBreaker, CircuitBreakerConfig};
use reliapi_idempotency::IdempotencyManager;
use reliapi_keypool::{KeyPoolManager, ProviderKey};
use reliapi_scheduler::RateScheduler;
use reliapi_store::KvStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Namespace prefix for every KV key the gateway writes.
pub const KEY_PREFIX: &str = "reliapi";

/// Failures building the application state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to build upstream client for target '{target}': {source}")]
    Client {
        target: String,
        source: reqwest::Error,
    },
}

pub struct AppState {
    pub config: GatewayConfig,
    pub cache: Cache,
    pub idempotency: IdempotencyManager,
    pub key_pool: Arc<KeyPoolManager>,
    pub scheduler: Arc<RateScheduler>,
    pub profiles: ClientProfileManager,
    pub probe_limiter: ProbeRateLimiter,
    pub metrics_handle: Option<PrometheusHandle>,
    /// True when the configured Redis store could not be reached and the
    /// gateway fell back to process-local state.
    pub store_degraded: bool,
    clients: HashMap<String, UpstreamClient>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn KvStore>,
        store_degraded: bool,
        metrics_handle: Option<PrometheusHandle>,
    ) -> Result<Self, StateError> {
        let mut clients = HashMap::new();
        for (name, target) in &config.targets {
            let breaker = Arc::new(CircuitBreaker::new(
                CircuitBreakerConfig::builder()
                    .failures_to_open(target.circuit.error_threshold)
                    .open_ttl(Duration::from_secs(target.circuit.cooldown_s))
                    .build(),
            ));
            let client = UpstreamClient::new(target, breaker).map_err(|source| {
                StateError::Client {
                    target: name.clone(),
                    source,
                }
            })?;
            clients.insert(name.clone(), client);
        }

        let mut pools: HashMap<String, Vec<ProviderKey>> = HashMap::new();
        for (provider, pool) in &config.provider_key_pools {
            let keys = pool
                .keys
                .iter()
                .map(|key| {
                    let mut provider_key =
                        ProviderKey::new(key.id.clone(), provider.clone(), key.api_key.clone());
                    if let Some(qps) = key.effective_qps() {
                        provider_key = provider_key.with_qps_limit(qps);
                    }
                    provider_key
                })
                .collect();
            pools.insert(provider.clone(), keys);
        }

        let profiles = ClientProfileManager::new(config.client_profiles.clone());

        Ok(Self {
            cache: Cache::new(Arc::clone(&store), KEY_PREFIX),
            idempotency: IdempotencyManager::new(store, KEY_PREFIX),
            key_pool: Arc::new(KeyPoolManager::new(pools)),
            scheduler: Arc::new(RateScheduler::new()),
            profiles,
            probe_limiter: ProbeRateLimiter::default(),
            metrics_handle,
            store_degraded,
            clients,
            background: Mutex::new(Vec::new()),
            config,
        })
    }

    /// The upstream client for a target; present for every configured
    /// target.
    pub fn client(&self, target: &str) -> Option<&UpstreamClient> {
        self.clients.get(target)
    }

    /// Resolves a tenant by API key. Keys are unique across tenants, so
    /// at most one matches.
    pub fn tenant_by_api_key(&self, api_key: &str) -> Option<(&str, &crate::config::TenantConfig)> {
        self.config
            .tenants
            .iter()
            .find(|(_, tenant)| tenant.api_key == api_key)
            .map(|(name, tenant)| (name.as_str(), tenant))
    }

    /// Spawns the key-pool decay loop and the bucket sweeper.
    pub fn start_background(self: &Arc<Self>) {
        let mut background = self.background.lock();
        background.push(self.key_pool.spawn_decay_loop());
        background.push(self.scheduler.spawn_sweeper());
    }

    /// Signals background loops and awaits their termination.
    pub async fn shutdown(&self) {
        self.key_pool.shutdown();
        self.scheduler.shutdown();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "background task aborted during shutdown");
            }
        }
    }
}
