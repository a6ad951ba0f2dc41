//! The request-processing pipelines.
//!
//! `http` handles the generic pass-through path, `llm` the normalised
//! chat-completion path, and `stream` the SSE variant. Shared request
//! plumbing (key switching, auth resolution, admission building) lives
//! here.

pub mod http;
pub mod llm;
pub mod stream;

use crate::config::{ClientProfileConfig, TargetConfig, TenantConfig};
use crate::metrics;
use crate::state::AppState;
use crate::upstream::AuthHeader;
use reliapi_keypool::{ProviderKey, MAX_KEY_SWITCHES};
use reliapi_scheduler::AdmissionRequest;
use std::collections::HashSet;

/// Per-request key switching state.
///
/// Bounds the number of switches and remembers which keys this request
/// has already burned so selection never hands one back.
#[derive(Debug, Default)]
pub struct KeySwitchState {
    switches: u32,
    used: HashSet<String>,
    provider: Option<String>,
}

impl KeySwitchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_switch(&self) -> bool {
        self.switches < MAX_KEY_SWITCHES
    }

    pub fn mark_used(&mut self, key_id: &str, provider: &str) {
        self.used.insert(key_id.to_string());
        self.provider = Some(provider.to_string());
    }

    pub fn record_switch(&mut self, from: &str, to: &str, reason: &'static str) {
        self.used.insert(from.to_string());
        self.switches += 1;
        if let Some(provider) = &self.provider {
            metrics::record_key_switch(provider, reason);
        }
        tracing::info!(from, to, reason, switches = self.switches, "switched provider key");
    }

    pub fn record_exhausted(&self) {
        if let Some(provider) = &self.provider {
            metrics::record_key_switches_exhausted(provider);
        }
    }

    pub fn excluded(&self) -> &HashSet<String> {
        &self.used
    }
}

/// Where the request's upstream credentials came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSource {
    Pool,
    TargetAuth,
    None,
}

/// Resolved upstream credentials for one dispatch.
pub struct ResolvedAuth {
    pub auth: Option<AuthHeader>,
    pub key: Option<ProviderKey>,
    pub source: AuthSource,
}

/// Picks credentials: a pooled key for the provider when one exists,
/// otherwise the target's static auth.
pub fn resolve_auth(
    state: &AppState,
    target: &TargetConfig,
    provider: &str,
    exclude: Option<&HashSet<String>>,
) -> ResolvedAuth {
    if state.key_pool.has_pool(provider) {
        if let Some(key) = state.key_pool.select_key(provider, exclude) {
            let auth = AuthHeader::bearer(key.secret.clone());
            return ResolvedAuth {
                auth: Some(auth),
                key: Some(key),
                source: AuthSource::Pool,
            };
        }
    }
    match target.auth.as_ref().and_then(AuthHeader::from_config) {
        Some(auth) => ResolvedAuth {
            auth: Some(auth),
            key: None,
            source: AuthSource::TargetAuth,
        },
        None => ResolvedAuth {
            auth: None,
            key: None,
            source: AuthSource::None,
        },
    }
}

/// Builds the scheduler admission for a dispatch.
///
/// Provider-key QPS comes from the pool key's ceiling, tightened by the
/// profile's per-key cap. The tenant bucket enforces the tighter of the
/// profile's per-tenant cap and the tenant's requests-per-minute
/// ceiling. The profile bucket carries the profile's per-key cap under
/// the profile's name.
pub fn build_admission<'a>(
    key: Option<&'a ProviderKey>,
    tenant: Option<&'a str>,
    tenant_config: Option<&'a TenantConfig>,
    profile_name: &'a str,
    profile: &'a ClientProfileConfig,
) -> AdmissionRequest<'a> {
    let provider_key = key.map(|key| {
        let mut qps = key.qps_limit;
        if let Some(profile_cap) = profile.max_qps_per_provider_key {
            qps = Some(qps.map_or(profile_cap, |q| q.min(profile_cap)));
        }
        (key.id.as_str(), qps.unwrap_or(0.0))
    });

    let tenant_rpm_qps = tenant_config
        .and_then(|t| t.rate_limit_rpm)
        .map(|rpm| f64::from(rpm) / 60.0);
    let tenant_qps = match (profile.max_qps_per_tenant, tenant_rpm_qps) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    let tenant = tenant.zip(tenant_qps);

    let profile_check = profile
        .max_qps_per_provider_key
        .map(|qps| (profile_name, qps));

    AdmissionRequest {
        provider_key,
        tenant,
        profile: profile_check,
    }
}

/// Maps a final upstream failure to the caller-visible error detail.
pub fn upstream_error_detail(
    err: &crate::upstream::UpstreamError,
    target_name: &str,
) -> crate::schemas::ErrorDetail {
    use crate::schemas::ErrorDetail;
    use crate::upstream::UpstreamError;
    use reliapi_core::{ErrorCode, ErrorKind};

    match err {
        UpstreamError::CircuitOpen => {
            ErrorDetail::new(ErrorKind::Network, ErrorCode::NetworkError, "circuit open for upstream")
                .target(target_name)
                .status_code(503)
                .source("reliapi")
                .hint("the upstream has been failing; retry after the cooldown")
        }
        UpstreamError::Status { status, retry_after, .. } => {
            let mut detail = ErrorDetail::new(
                ErrorKind::Upstream,
                ErrorCode::from_http_status(*status),
                format!("upstream returned {status}"),
            )
            .retryable(*status == 429 || *status >= 500)
            .target(target_name)
            .status_code(*status)
            .source("upstream");
            if let Some(retry_after) = retry_after {
                detail = detail.retry_after_s(retry_after.as_secs_f64());
            }
            detail
        }
        UpstreamError::Timeout(message) | UpstreamError::Network(message) => {
            ErrorDetail::new(
                ErrorKind::Network,
                ErrorCode::NetworkError,
                format!("network error: {message}"),
            )
            .target(target_name)
            .status_code(502)
            .source("upstream")
        }
    }
}
