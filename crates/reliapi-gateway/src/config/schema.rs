//! Serde schema for the gateway configuration.

use reliapi_retry::{ErrorClass, RetryMatrix, RetryPolicy};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl_s() -> u64 {
    3600
}

fn default_error_threshold() -> u32 {
    5
}

fn default_cooldown_s() -> u64 {
    60
}

fn default_max_parallel() -> u32 {
    10
}

fn default_burst_size() -> u32 {
    5
}

fn default_max_concurrent() -> u32 {
    2
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub targets: HashMap<String, TargetConfig>,
    #[serde(default)]
    pub tenants: HashMap<String, TenantConfig>,
    #[serde(default)]
    pub provider_key_pools: HashMap<String, ProviderKeyPoolConfig>,
    #[serde(default)]
    pub client_profiles: HashMap<String, ClientProfileConfig>,
}

/// One named upstream and its policy bundle. Immutable at runtime.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub llm: Option<LlmConfig>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub fallback_targets: Option<Vec<String>>,
    #[serde(default)]
    pub retry_matrix: Option<HashMap<String, RetryPolicy>>,
}

impl TargetConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Builds the retry matrix for this target; the stock matrix applies
    /// when none is configured.
    pub fn retry_matrix(&self) -> RetryMatrix {
        match &self.retry_matrix {
            None => RetryMatrix::default(),
            Some(entries) => {
                let mut matrix = RetryMatrix::empty();
                for (class, policy) in entries {
                    // Keys were validated at load time.
                    if let Ok(class) = class.parse::<ErrorClass>() {
                        matrix = matrix.with_policy(class, policy.clone());
                    }
                }
                matrix
            }
        }
    }

    /// Effective cache TTL after request and tenant overrides.
    pub fn cache_ttl(&self, request_override: Option<u64>, tenant_override: Option<u64>) -> Duration {
        let secs = request_override
            .or(tenant_override)
            .unwrap_or(self.cache.ttl_s);
        Duration::from_secs(secs)
    }
}

/// Circuit breaker parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitConfig {
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "default_cooldown_s")]
    pub cooldown_s: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            error_threshold: default_error_threshold(),
            cooldown_s: default_cooldown_s(),
        }
    }
}

/// Cache parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_s")]
    pub ttl_s: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_s: default_cache_ttl_s(),
        }
    }
}

/// LLM-specific target parameters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub soft_cost_cap_usd: Option<f64>,
    #[serde(default)]
    pub hard_cost_cap_usd: Option<f64>,
}

/// Static upstream authentication.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub kind: AuthKind,
    #[serde(default)]
    pub env_var: Option<String>,
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    /// Key material read from an environment variable at load.
    BearerEnv,
    /// Key material inline (possibly via `env:VAR` indirection).
    ApiKey,
}

/// Tenant tier; free tenants lose fallback chaining, streaming, and
/// idempotency keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    #[default]
    Standard,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Standard => "standard",
        }
    }
}

/// Per-target cost cap override.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetCaps {
    #[serde(default)]
    pub soft_cost_cap_usd: Option<f64>,
    #[serde(default)]
    pub hard_cost_cap_usd: Option<f64>,
}

/// One tenant: API key plus overrides. A given API key resolves to at
/// most one tenant.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenantConfig {
    pub api_key: String,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub budget_caps: Option<HashMap<String, BudgetCaps>>,
    #[serde(default)]
    pub fallback_targets: Option<HashMap<String, Vec<String>>>,
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,
    #[serde(default)]
    pub cache_ttl_override: Option<HashMap<String, u64>>,
    #[serde(default)]
    pub profile: Option<String>,
}

/// Concurrency and rate parameters applied to a caller class.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientProfileConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel_requests: u32,
    #[serde(default)]
    pub max_qps_per_tenant: Option<f64>,
    #[serde(default)]
    pub max_qps_per_provider_key: Option<f64>,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    #[serde(default)]
    pub default_timeout_s: Option<f64>,
}

impl Default for ClientProfileConfig {
    fn default() -> Self {
        Self {
            max_parallel_requests: default_max_parallel(),
            max_qps_per_tenant: None,
            max_qps_per_provider_key: None,
            burst_size: default_burst_size(),
            default_timeout_s: None,
        }
    }
}

/// One provider's key pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderKeyPoolConfig {
    pub keys: Vec<ProviderKeyConfig>,
}

/// One pooled key. `api_key` accepts `env:VAR_NAME` indirection.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderKeyConfig {
    pub id: String,
    pub api_key: String,
    #[serde(default)]
    pub qps_limit: Option<f64>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

impl ProviderKeyConfig {
    /// The effective QPS ceiling; `rate_limit.max_qps` wins over the
    /// plain `qps_limit`.
    pub fn effective_qps(&self) -> Option<f64> {
        self.rate_limit
            .as_ref()
            .map(|r| r.max_qps)
            .or(self.qps_limit)
    }
}

/// Per-key rate limit block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    pub max_qps: f64,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
}
