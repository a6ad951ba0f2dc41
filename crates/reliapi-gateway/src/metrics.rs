//! Metric recording helpers.
//!
//! All metric names carry the `reliapi_` prefix. Upstream status codes
//! are normalised to bounded-cardinality labels before recording; actual
//! codes appear only in logs and response detail.

use metrics::{counter, histogram};
use reliapi_core::{ErrorCode, UpstreamStatus};

/// Request kind label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Http,
    Llm,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Http => "http",
            RequestKind::Llm => "llm",
        }
    }
}

fn tenant_label(tenant: Option<&str>) -> String {
    tenant.unwrap_or("default").to_string()
}

pub fn record_request(
    target: &str,
    kind: RequestKind,
    stream: bool,
    outcome: &'static str,
    tenant: Option<&str>,
    duration_ms: u64,
) {
    let stream_label = if stream { "true" } else { "false" };
    counter!(
        "reliapi_requests_total",
        "target" => target.to_string(),
        "kind" => kind.as_str(),
        "stream" => stream_label,
        "outcome" => outcome,
        "tenant" => tenant_label(tenant),
    )
    .increment(1);
    histogram!(
        "reliapi_request_latency_ms",
        "target" => target.to_string(),
        "kind" => kind.as_str(),
        "stream" => stream_label,
        "tenant" => tenant_label(tenant),
    )
    .record(duration_ms as f64);
}

pub fn record_cache(target: &str, kind: RequestKind, hit: bool, tenant: Option<&str>) {
    let name = if hit {
        "reliapi_cache_hits_total"
    } else {
        "reliapi_cache_misses_total"
    };
    counter!(
        name,
        "target" => target.to_string(),
        "kind" => kind.as_str(),
        "tenant" => tenant_label(tenant),
    )
    .increment(1);
}

pub fn record_idempotent_hit(target: &str, kind: RequestKind, tenant: Option<&str>) {
    counter!(
        "reliapi_idempotent_hits_total",
        "target" => target.to_string(),
        "kind" => kind.as_str(),
        "tenant" => tenant_label(tenant),
    )
    .increment(1);
}

pub fn record_error(
    target: &str,
    kind: RequestKind,
    code: ErrorCode,
    upstream_status: Option<u16>,
    tenant: Option<&str>,
) {
    counter!(
        "reliapi_errors_total",
        "target" => target.to_string(),
        "kind" => kind.as_str(),
        "error_code" => code.as_str(),
        "upstream_status" => UpstreamStatus::normalize(upstream_status).as_str(),
        "tenant" => tenant_label(tenant),
    )
    .increment(1);
}

pub fn record_budget_event(target: &str, event: &'static str, tenant: Option<&str>) {
    counter!(
        "reliapi_budget_events_total",
        "target" => target.to_string(),
        "event" => event,
        "tenant" => tenant_label(tenant),
    )
    .increment(1);
}

/// Cumulative LLM spend. Counters are integral, so the value is recorded
/// in micro-USD.
pub fn record_cost(target: &str, tenant: Option<&str>, cost_usd: f64) {
    if cost_usd > 0.0 {
        counter!(
            "reliapi_llm_cost_usd_total",
            "target" => target.to_string(),
            "tenant" => tenant_label(tenant),
        )
        .increment((cost_usd * 1_000_000.0) as u64);
    }
}

pub fn record_key_switch(provider: &str, reason: &'static str) {
    counter!(
        "reliapi_key_switches_total",
        "provider" => provider.to_string(),
        "reason" => reason,
    )
    .increment(1);
}

pub fn record_key_switches_exhausted(provider: &str) {
    counter!(
        "reliapi_key_switches_exhausted_total",
        "provider" => provider.to_string(),
    )
    .increment(1);
}

pub fn record_rate_limited(bucket: &'static str) {
    counter!("reliapi_rate_scheduler_429_total", "bucket" => bucket, "source" => "reliapi")
        .increment(1);
}
