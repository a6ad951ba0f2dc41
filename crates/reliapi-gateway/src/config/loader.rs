//! Configuration loading, secret resolution, and validation.

use super::schema::*;
use super::ConfigError;
use reliapi_retry::ErrorClass;
use std::collections::HashSet;
use std::path::Path;

const ENV_PREFIX: &str = "env:";

/// Loads, resolves, and validates a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<GatewayConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }
    let raw = std::fs::read_to_string(path)?;
    load_config_str(&raw)
}

/// Loads configuration from a YAML string; used by tests.
pub fn load_config_str(raw: &str) -> Result<GatewayConfig, ConfigError> {
    let mut config: GatewayConfig = serde_yaml::from_str(raw)?;
    resolve_secrets(&mut config)?;
    validate(&config)?;
    Ok(config)
}

/// Resolves `env:VAR` indirections and `bearer_env` variables into
/// in-memory key material. Missing variables fail the load.
fn resolve_secrets(config: &mut GatewayConfig) -> Result<(), ConfigError> {
    for target in config.targets.values_mut() {
        if let Some(auth) = target.auth.as_mut() {
            match auth.kind {
                AuthKind::BearerEnv => {
                    let var = auth
                        .env_var
                        .clone()
                        .ok_or_else(|| ConfigError::MissingEnv("<bearer_env without env_var>".into()))?;
                    auth.api_key = Some(read_env(&var)?);
                }
                AuthKind::ApiKey => {
                    if let Some(key) = auth.api_key.clone() {
                        if let Some(var) = key.strip_prefix(ENV_PREFIX) {
                            auth.api_key = Some(read_env(var)?);
                        }
                    } else if let Some(var) = auth.env_var.clone() {
                        auth.api_key = Some(read_env(&var)?);
                    }
                }
            }
        }
    }
    for pool in config.provider_key_pools.values_mut() {
        for key in pool.keys.iter_mut() {
            if let Some(var) = key.api_key.strip_prefix(ENV_PREFIX) {
                key.api_key = read_env(var)?;
            }
        }
    }
    for tenant in config.tenants.values_mut() {
        if let Some(var) = tenant.api_key.strip_prefix(ENV_PREFIX) {
            tenant.api_key = read_env(var)?;
        }
    }
    Ok(())
}

fn read_env(var: &str) -> Result<String, ConfigError> {
    std::env::var(var).map_err(|_| ConfigError::MissingEnv(var.to_string()))
}

fn validate(config: &GatewayConfig) -> Result<(), ConfigError> {
    for (name, target) in &config.targets {
        let fail = |message: String| ConfigError::InvalidTarget {
            target: name.clone(),
            message,
        };
        if !target.base_url.starts_with("http://") && !target.base_url.starts_with("https://") {
            return Err(fail(format!("base_url '{}' must be http(s)", target.base_url)));
        }
        if target.timeout_ms == 0 || target.timeout_ms > 300_000 {
            return Err(fail(format!(
                "timeout_ms {} must be in (0, 300000]",
                target.timeout_ms
            )));
        }
        if target.circuit.error_threshold == 0 {
            return Err(fail("circuit.error_threshold must be positive".into()));
        }
        if target.circuit.cooldown_s == 0 {
            return Err(fail("circuit.cooldown_s must be positive".into()));
        }
        if target.cache.ttl_s == 0 {
            return Err(fail("cache.ttl_s must be positive".into()));
        }
        if let Some(llm) = &target.llm {
            if let Some(temperature) = llm.temperature {
                if !(0.0..=2.0).contains(&temperature) {
                    return Err(fail(format!("llm.temperature {temperature} must be in [0, 2]")));
                }
            }
            if let Some(max_tokens) = llm.max_tokens {
                if max_tokens == 0 {
                    return Err(fail("llm.max_tokens must be positive".into()));
                }
            }
            if let (Some(soft), Some(hard)) = (llm.soft_cost_cap_usd, llm.hard_cost_cap_usd) {
                if hard < soft {
                    return Err(fail(format!(
                        "hard_cost_cap_usd ({hard}) must be >= soft_cost_cap_usd ({soft})"
                    )));
                }
            }
        }
        if let Some(matrix) = &target.retry_matrix {
            for (class, policy) in matrix {
                class
                    .parse::<ErrorClass>()
                    .map_err(|e| fail(e.to_string()))?;
                if policy.attempts == 0 {
                    return Err(fail(format!("retry_matrix.{class}.attempts must be positive")));
                }
            }
        }
        if let Some(fallbacks) = &target.fallback_targets {
            for fallback in fallbacks {
                if !config.targets.contains_key(fallback) {
                    return Err(fail(format!("fallback target '{fallback}' does not exist")));
                }
            }
        }
    }

    let mut seen_api_keys: HashSet<&str> = HashSet::new();
    for (name, tenant) in &config.tenants {
        let fail = |message: String| ConfigError::InvalidTenant {
            tenant: name.clone(),
            message,
        };
        if tenant.api_key.is_empty() {
            return Err(fail("api_key must not be empty".into()));
        }
        if !seen_api_keys.insert(tenant.api_key.as_str()) {
            return Err(fail("api_key is already used by another tenant".into()));
        }
        if let Some(rpm) = tenant.rate_limit_rpm {
            if rpm == 0 {
                return Err(fail("rate_limit_rpm must be at least 1".into()));
            }
        }
        if let Some(profile) = &tenant.profile {
            if !config.client_profiles.contains_key(profile) && profile != "default" {
                return Err(fail(format!("profile '{profile}' does not exist")));
            }
        }
        if let Some(overrides) = &tenant.fallback_targets {
            for (target, fallbacks) in overrides {
                if !config.targets.contains_key(target) {
                    return Err(fail(format!("fallback override for unknown target '{target}'")));
                }
                for fallback in fallbacks {
                    if !config.targets.contains_key(fallback) {
                        return Err(fail(format!("fallback target '{fallback}' does not exist")));
                    }
                }
            }
        }
        if let Some(caps) = &tenant.budget_caps {
            for target in caps.keys() {
                if !config.targets.contains_key(target) {
                    return Err(fail(format!("budget cap for unknown target '{target}'")));
                }
            }
        }
        if let Some(ttls) = &tenant.cache_ttl_override {
            for (target, ttl) in ttls {
                if !config.targets.contains_key(target) {
                    return Err(fail(format!("cache TTL override for unknown target '{target}'")));
                }
                if *ttl == 0 {
                    return Err(fail(format!("cache TTL override for '{target}' must be positive")));
                }
            }
        }
    }

    for (provider, pool) in &config.provider_key_pools {
        let fail = |message: String| ConfigError::InvalidPool {
            provider: provider.clone(),
            message,
        };
        if pool.keys.is_empty() {
            return Err(fail("pool must contain at least one key".into()));
        }
        let mut ids = HashSet::new();
        for key in &pool.keys {
            if !ids.insert(key.id.as_str()) {
                return Err(fail(format!("duplicate key id '{}'", key.id)));
            }
            if key.api_key.is_empty() {
                return Err(fail(format!("key '{}' has empty api_key", key.id)));
            }
            if let Some(qps) = key.qps_limit {
                if qps <= 0.0 {
                    return Err(fail(format!("key '{}' qps_limit must be positive", key.id)));
                }
            }
            if let Some(rate) = &key.rate_limit {
                if rate.max_qps <= 0.0 {
                    return Err(fail(format!("key '{}' rate_limit.max_qps must be positive", key.id)));
                }
                if rate.burst_size == 0 || rate.max_concurrent == 0 {
                    return Err(fail(format!(
                        "key '{}' rate_limit burst_size and max_concurrent must be positive",
                        key.id
                    )));
                }
            }
        }
    }

    for (name, profile) in &config.client_profiles {
        let fail = |message: String| ConfigError::InvalidProfile {
            profile: name.clone(),
            message,
        };
        if profile.max_parallel_requests == 0 {
            return Err(fail("max_parallel_requests must be positive".into()));
        }
        if profile.burst_size == 0 {
            return Err(fail("burst_size must be positive".into()));
        }
        for (label, qps) in [
            ("max_qps_per_tenant", profile.max_qps_per_tenant),
            ("max_qps_per_provider_key", profile.max_qps_per_provider_key),
        ] {
            if let Some(qps) = qps {
                if qps <= 0.0 {
                    return Err(fail(format!("{label} must be positive")));
                }
            }
        }
        if let Some(timeout) = profile.default_timeout_s {
            if timeout <= 0.0 {
                return Err(fail("default_timeout_s must be positive".into()));
            }
        }
    }

    Ok(())
}
