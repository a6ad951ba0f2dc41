//! The LLM proxy pipeline (non-streaming).

use super::{build_admission, resolve_auth, upstream_error_detail, KeySwitchState};
use crate::config::Tier;
use crate::metrics::{self, RequestKind};
use crate::schemas::{ApiResponse, ErrorDetail, LlmProxyRequest, Meta};
use crate::state::AppState;
use crate::upstream::{AuthHeader, UpstreamError};
use futures::future::BoxFuture;
use reliapi_cache::RequestParts;
use reliapi_core::{ErrorCode, ErrorKind};
use reliapi_idempotency::{request_hash, Registration};
use reliapi_keypool::KeyErrorKind;
use reliapi_llm::{ChatParams, CostEstimator, LlmAdapter, TokenUsage};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Instant;

/// Bound on fallback-chain recursion; guards against configuration
/// cycles.
const MAX_FALLBACK_DEPTH: u8 = 3;

/// Model assumed when neither the request nor the target names one.
const FALLBACK_MODEL: &str = "gpt-4";

/// Resolved knobs for one LLM dispatch after config ceilings.
struct LlmCall {
    model: String,
    max_tokens: Option<u32>,
    temperature: Option<f64>,
    cost_estimate_usd: Option<f64>,
    cost_policy_applied: Option<String>,
    max_tokens_reduced: bool,
    original_max_tokens: Option<u32>,
}

/// Handles one `POST /proxy/llm` request (non-streaming).
///
/// `allow_idempotency` is disabled for fallback recursion so a fallback
/// call never collides with the original registration.
pub fn handle_llm_proxy<'a>(
    state: &'a AppState,
    request: &'a LlmProxyRequest,
    request_id: &'a str,
    tenant: Option<&'a str>,
    tier: Tier,
    profile_name: &'a str,
    allow_idempotency: bool,
    depth: u8,
) -> BoxFuture<'a, ApiResponse> {
    Box::pin(async move {
        handle_llm_proxy_inner(
            state,
            request,
            request_id,
            tenant,
            tier,
            profile_name,
            allow_idempotency,
            depth,
        )
        .await
    })
}

#[allow(clippy::too_many_arguments)]
async fn handle_llm_proxy_inner(
    state: &AppState,
    request: &LlmProxyRequest,
    request_id: &str,
    tenant: Option<&str>,
    tier: Tier,
    profile_name: &str,
    allow_idempotency: bool,
    depth: u8,
) -> ApiResponse {
    let started = Instant::now();
    let target_name = request.target.as_str();

    let make_meta = |provider: Option<&str>, model: Option<&str>| {
        let mut meta = Meta::new(request_id);
        meta.target = Some(target_name.to_string());
        meta.provider = provider.map(str::to_string);
        meta.model = model.map(str::to_string);
        meta.duration_ms = started.elapsed().as_millis() as u64;
        meta
    };

    let Some(target) = state.config.targets.get(target_name) else {
        return ApiResponse::error(
            ErrorDetail::new(
                ErrorKind::Client,
                ErrorCode::NotFound,
                format!("target '{target_name}' not found"),
            )
            .status_code(404),
            make_meta(None, None),
        );
    };
    let Some(llm) = target.llm.as_ref() else {
        return ApiResponse::error(
            ErrorDetail::new(
                ErrorKind::Client,
                ErrorCode::InvalidTarget,
                format!("target '{target_name}' is not configured for LLM"),
            )
            .status_code(400)
            .target(target_name),
            make_meta(None, None),
        );
    };

    // Config ceilings: the request never exceeds what the target allows.
    let model = request
        .model
        .clone()
        .or_else(|| llm.default_model.clone())
        .unwrap_or_else(|| FALLBACK_MODEL.to_string());
    let max_tokens = match (request.max_tokens, llm.max_tokens) {
        (Some(requested), Some(ceiling)) => Some(requested.min(ceiling)),
        (requested, ceiling) => requested.or(ceiling),
    };
    let temperature = match (request.temperature, llm.temperature) {
        (Some(requested), Some(ceiling)) => Some(requested.min(ceiling)),
        (requested, ceiling) => requested.or(ceiling),
    };

    // Provider and adapter resolution.
    let provider = llm
        .provider
        .clone()
        .or_else(|| LlmAdapter::detect_provider(&target.base_url).map(str::to_string));
    let Some(provider) = provider else {
        let detail = ErrorDetail::new(
            ErrorKind::Config,
            ErrorCode::UnknownProvider,
            format!(
                "could not determine provider for target '{target_name}'; set llm.provider or use a known base_url"
            ),
        )
        .status_code(500)
        .target(target_name);
        metrics::record_error(target_name, RequestKind::Llm, detail.code, None, tenant);
        return ApiResponse::error(detail, make_meta(None, Some(&model)));
    };
    let Some(adapter) = LlmAdapter::for_provider(&provider) else {
        let detail = ErrorDetail::new(
            ErrorKind::Config,
            ErrorCode::AdapterNotFound,
            format!("no adapter for provider '{provider}'"),
        )
        .status_code(500)
        .target(target_name);
        metrics::record_error(target_name, RequestKind::Llm, detail.code, None, tenant);
        return ApiResponse::error(detail, make_meta(Some(&provider), Some(&model)));
    };

    // Budget gate.
    let tenant_config = tenant.and_then(|t| state.config.tenants.get(t));
    let caps = tenant_config
        .and_then(|t| t.budget_caps.as_ref())
        .and_then(|caps| caps.get(target_name));
    let hard_cap = caps
        .and_then(|c| c.hard_cost_cap_usd)
        .or(llm.hard_cost_cap_usd);
    let soft_cap = caps
        .and_then(|c| c.soft_cost_cap_usd)
        .or(llm.soft_cost_cap_usd);

    let mut call = LlmCall {
        cost_estimate_usd: CostEstimator::estimate_from_messages(
            &provider,
            &model,
            &request.messages,
            max_tokens,
        ),
        model,
        max_tokens,
        temperature,
        cost_policy_applied: None,
        max_tokens_reduced: false,
        original_max_tokens: None,
    };

    if let (Some(cap), Some(estimate)) = (hard_cap, call.cost_estimate_usd) {
        if estimate > cap {
            metrics::record_budget_event(target_name, "hard_cap", tenant);
            let detail = ErrorDetail::new(
                ErrorKind::Budget,
                ErrorCode::BudgetExceeded,
                format!("estimated cost ${estimate:.6} exceeds hard cap ${cap:.6}"),
            )
            .status_code(400)
            .target(target_name)
            .details(json!({
                "cost_estimate_usd": estimate,
                "hard_cost_cap_usd": cap,
                "model": call.model,
                "max_tokens": call.max_tokens,
            }));
            metrics::record_error(target_name, RequestKind::Llm, detail.code, None, tenant);
            let mut meta = make_meta(Some(&provider), Some(&call.model));
            meta.cost_estimate_usd = Some(estimate);
            meta.cost_policy_applied = Some("hard_cap_rejected".to_string());
            metrics::record_request(target_name, RequestKind::Llm, false, "error", tenant, meta.duration_ms);
            return ApiResponse::error(detail, meta);
        }
    }
    if let (Some(cap), Some(estimate)) = (soft_cap, call.cost_estimate_usd) {
        if estimate > cap {
            let prompt_chars: u64 = request.messages.iter().map(|m| m.content.len() as u64).sum();
            let budget_base = call.max_tokens.unwrap_or(((prompt_chars / 4) / 2).max(1) as u32);
            let factor = cap / estimate;
            call.original_max_tokens = call.max_tokens;
            call.max_tokens = Some(((f64::from(budget_base) * factor * 0.9) as u32).max(1));
            call.max_tokens_reduced = true;
            call.cost_policy_applied = Some("soft_cap_throttled".to_string());
            metrics::record_budget_event(target_name, "soft_cap", tenant);
            call.cost_estimate_usd = CostEstimator::estimate_from_messages(
                &provider,
                &call.model,
                &request.messages,
                call.max_tokens,
            );
        }
    }

    // Provider payload; its canonical serialisation is the cache and
    // idempotency identity of this request.
    let payload = adapter.prepare_request(ChatParams {
        messages: &request.messages,
        model: &call.model,
        max_tokens: call.max_tokens,
        temperature: call.temperature,
        top_p: request.top_p,
        stop: request.stop.as_deref(),
        stream: false,
    });
    let payload_bytes = serde_json::to_vec(&payload).unwrap_or_default();
    let api_path = adapter.api_path();
    let full_url = format!("{}{api_path}", target.base_url.trim_end_matches('/'));

    let tenant_ttl = tenant_config
        .and_then(|t| t.cache_ttl_override.as_ref())
        .and_then(|o| o.get(target_name))
        .copied();
    let cache_ttl = target.cache_ttl(request.cache, tenant_ttl);
    let cache_parts = RequestParts {
        method: "POST",
        url: &full_url,
        headers: None,
        body: Some(&payload_bytes),
        query: None,
    };

    if target.cache.enabled {
        if let Some(cached) = state.cache.get(cache_parts, true, tenant).await {
            metrics::record_cache(target_name, RequestKind::Llm, true, tenant);
            let mut meta = make_meta(Some(&provider), Some(&call.model));
            meta.cache_hit = true;
            meta.cost_usd = cached.get("cost_usd").and_then(Value::as_f64);
            metrics::record_request(target_name, RequestKind::Llm, false, "success", tenant, meta.duration_ms);
            let data = cached.get("body").cloned().unwrap_or(Value::Null);
            return ApiResponse::success(data, meta);
        }
    }

    // Idempotency on the canonical payload.
    let idempotency_key = request
        .idempotency_key
        .as_deref()
        .filter(|_| allow_idempotency);
    let mut marked_in_progress = false;
    if let Some(key) = idempotency_key {
        let hash = request_hash("POST", &full_url, None, Some(&payload_bytes));
        match state.idempotency.register(key, &hash, request_id, tenant).await {
            Registration::New => {
                state.idempotency.mark_in_progress(key, tenant).await;
                marked_in_progress = true;
            }
            Registration::Conflict { existing_request_id } => {
                return ApiResponse::error(
                    ErrorDetail::new(
                        ErrorKind::IdempotencyConflict,
                        ErrorCode::IdempotencyConflict,
                        format!("idempotency key '{key}' used with a different request"),
                    )
                    .status_code(409)
                    .target(target_name)
                    .details(json!({"existing_request_id": existing_request_id})),
                    make_meta(Some(&provider), Some(&call.model)),
                );
            }
            Registration::Existing { .. } => {
                let stored = match state.idempotency.result(key, tenant).await {
                    Some(stored) => Some(stored),
                    None => state.idempotency.wait_for_result(key, tenant).await,
                };
                match stored {
                    Some(stored) => {
                        metrics::record_idempotent_hit(target_name, RequestKind::Llm, tenant);
                        let mut meta = make_meta(Some(&provider), Some(&call.model));
                        meta.idempotent_hit = true;
                        meta.cost_usd = stored.get("cost_usd").and_then(Value::as_f64);
                        metrics::record_request(target_name, RequestKind::Llm, false, "success", tenant, meta.duration_ms);
                        let data = stored.get("data").cloned().unwrap_or(Value::Null);
                        return ApiResponse::success(data, meta);
                    }
                    None => {
                        return ApiResponse::error(
                            ErrorDetail::new(
                                ErrorKind::IdempotencyConflict,
                                ErrorCode::IdempotencyConflict,
                                format!("timed out waiting for in-flight request with key '{key}'"),
                            )
                            .retryable(true)
                            .status_code(409)
                            .target(target_name),
                            make_meta(Some(&provider), Some(&call.model)),
                        );
                    }
                }
            }
        }
    }

    // Credentials and admission.
    let mut switch_state = KeySwitchState::new();
    let resolved = resolve_auth(state, target, &provider, None);
    let mut current_key = resolved.key;
    let mut current_auth = resolved.auth;
    if let Some(key) = &current_key {
        switch_state.mark_used(&key.id, &key.provider);
    }
    let profile = state.profiles.get(profile_name);
    let admission = build_admission(
        current_key.as_ref(),
        tenant,
        tenant_config,
        profile_name,
        profile,
    );

    if let Err(rejection) = state.scheduler.check_rate_limit(admission).await {
        metrics::record_rate_limited(rejection.bucket.as_str());
        if marked_in_progress {
            if let Some(key) = idempotency_key {
                state.idempotency.clear_in_progress(key, tenant).await;
            }
        }
        let mut detail = ErrorDetail::new(
            ErrorKind::RateLimit,
            ErrorCode::RateLimitReliapi,
            format!("rate limit exceeded ({})", rejection.bucket.as_str()),
        )
        .status_code(429)
        .source("reliapi")
        .retry_after_s(rejection.retry_after.as_secs_f64())
        .target(target_name)
        .hint("the upstream provider is being protected");
        if let Some(key) = &current_key {
            detail = detail.provider_key_status(key.status.as_str());
        }
        return ApiResponse::error(detail, make_meta(Some(&provider), Some(&call.model)));
    }
    let _slots = state.scheduler.acquire_slots(admission).await;

    let client = state
        .client(target_name)
        .expect("client exists for every configured target");
    let mut request_headers = HashMap::new();
    request_headers.insert("Content-Type".to_string(), "application/json".to_string());

    let (mut result, retries) = client
        .request(
            "POST",
            api_path,
            Some(&request_headers),
            Some(&payload_bytes),
            None,
            current_auth.as_ref(),
        )
        .await;
    let mut total_retries = retries;

    // Fallback-target recursion on retryable failure. Fallback calls run
    // with idempotency disabled and observe their own target's breaker.
    if let Err(err) = &result {
        let retryable = matches!(
            err,
            UpstreamError::Status { status, .. } if *status == 429 || *status >= 500
        );
        let fallbacks = tenant_config
            .and_then(|t| t.fallback_targets.as_ref())
            .and_then(|o| o.get(target_name))
            .or(target.fallback_targets.as_ref());
        let chain_allowed = tier != Tier::Free && depth < MAX_FALLBACK_DEPTH;
        if retryable && chain_allowed {
            if let Some(fallbacks) = fallbacks {
                for fallback_name in fallbacks {
                    let fallback = state.config.targets.get(fallback_name);
                    if fallback.and_then(|t| t.llm.as_ref()).is_none() {
                        continue;
                    }
                    let mut fallback_request = request.clone();
                    fallback_request.target = fallback_name.clone();
                    fallback_request.idempotency_key = None;
                    tracing::info!(
                        from = target_name,
                        to = fallback_name.as_str(),
                        "retrying via fallback target"
                    );
                    let mut fallback_response = handle_llm_proxy(
                        state,
                        &fallback_request,
                        request_id,
                        tenant,
                        tier,
                        profile_name,
                        false,
                        depth + 1,
                    )
                    .await;
                    if fallback_response.success {
                        if marked_in_progress {
                            if let Some(key) = idempotency_key {
                                state.idempotency.clear_in_progress(key, tenant).await;
                            }
                        }
                        fallback_response.meta.fallback_used = Some(true);
                        fallback_response.meta.fallback_target = Some(fallback_name.clone());
                        return fallback_response;
                    }
                }
            }
        }
    }

    // Key switching on retryable upstream failures, bounded by the
    // per-request budget.
    loop {
        let failure_status = match &result {
            Err(UpstreamError::Status { status, .. }) if *status == 429 || *status >= 500 => {
                *status
            }
            Err(UpstreamError::Timeout(_)) | Err(UpstreamError::Network(_)) => {
                if let Some(key) = &current_key {
                    state.key_pool.record_error(&key.id, KeyErrorKind::Network);
                }
                break;
            }
            _ => break,
        };
        let Some(key) = current_key.clone() else {
            break;
        };
        state
            .key_pool
            .record_error(&key.id, KeyErrorKind::from_status(failure_status));
        if !switch_state.can_switch() {
            switch_state.record_exhausted();
            break;
        }
        let Some(new_key) = state
            .key_pool
            .select_key(&key.provider, Some(switch_state.excluded()))
        else {
            break;
        };
        if new_key.id == key.id {
            break;
        }
        let reason = if failure_status == 429 { "429" } else { "5xx" };
        switch_state.record_switch(&key.id, &new_key.id, reason);
        current_auth = Some(AuthHeader::bearer(new_key.secret.clone()));
        current_key = Some(new_key);
        let (next, retries) = client
            .request(
                "POST",
                api_path,
                Some(&request_headers),
                Some(&payload_bytes),
                None,
                current_auth.as_ref(),
            )
            .await;
        total_retries += retries + 1;
        result = next;
    }

    let finish_error = |detail: ErrorDetail, upstream_status: Option<u16>| {
        let meta = {
            let mut meta = make_meta(Some(&provider), Some(&call.model));
            meta.retries = total_retries;
            meta.cost_estimate_usd = call.cost_estimate_usd;
            meta.cost_policy_applied = call.cost_policy_applied.clone();
            meta
        };
        metrics::record_error(target_name, RequestKind::Llm, detail.code, upstream_status, tenant);
        metrics::record_request(target_name, RequestKind::Llm, false, "error", tenant, meta.duration_ms);
        tracing::error!(
            request_id,
            target = target_name,
            kind = "llm",
            model = call.model.as_str(),
            outcome = "error",
            error_code = detail.code.as_str(),
            upstream_status,
            latency_ms = meta.duration_ms,
            tenant,
            "proxied llm request"
        );
        ApiResponse::error(detail, meta)
    };

    let response = match result {
        Ok(response) => response,
        Err(err) => {
            if marked_in_progress {
                if let Some(key) = idempotency_key {
                    state.idempotency.clear_in_progress(key, tenant).await;
                }
            }
            let mut detail = upstream_error_detail(&err, target_name);
            if let Some(key) = &current_key {
                detail = detail.provider_key_status(key.status.as_str());
            }
            return finish_error(detail, err.status());
        }
    };

    if response.status >= 400 {
        if let Some(key) = &current_key {
            state.key_pool.record_error(&key.id, KeyErrorKind::Other);
        }
        if marked_in_progress {
            if let Some(key) = idempotency_key {
                state.idempotency.clear_in_progress(key, tenant).await;
            }
        }
        let detail = ErrorDetail::new(
            ErrorKind::Upstream,
            ErrorCode::from_http_status(response.status),
            format!("upstream returned {}", response.status),
        )
        .retryable(false)
        .status_code(response.status)
        .source("upstream")
        .target(target_name);
        return finish_error(detail, Some(response.status));
    }

    if let Some(key) = &current_key {
        state.key_pool.record_success(&key.id);
    }

    let parsed: Result<Value, _> = serde_json::from_slice(&response.body);
    let normalized = parsed
        .map_err(|e| e.to_string())
        .and_then(|value| adapter.parse_response(&value).map_err(|e| e.to_string()));
    let normalized = match normalized {
        Ok(normalized) => normalized,
        Err(message) => {
            if marked_in_progress {
                if let Some(key) = idempotency_key {
                    state.idempotency.clear_in_progress(key, tenant).await;
                }
            }
            let detail = ErrorDetail::new(
                ErrorKind::Internal,
                ErrorCode::InternalError,
                format!("invalid response from {provider}: {message}"),
            )
            .status_code(500)
            .target(target_name);
            return finish_error(detail, None);
        }
    };

    let usage = normalized.usage.unwrap_or(TokenUsage::default());
    let cost_usd = adapter.cost_usd(&call.model, usage);
    let result_data = json!({
        "content": normalized.content,
        "role": normalized.role,
        "finish_reason": normalized.finish_reason,
        "usage": {
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total(),
        },
    });

    if target.cache.enabled {
        state
            .cache
            .set(
                cache_parts,
                &json!({"body": result_data.clone(), "cost_usd": cost_usd}),
                cache_ttl,
                true,
                tenant,
            )
            .await;
    }
    if let Some(key) = idempotency_key {
        state
            .idempotency
            .store_result(
                key,
                &json!({"data": result_data.clone(), "cost_usd": cost_usd}),
                cache_ttl,
                tenant,
            )
            .await;
        state.idempotency.clear_in_progress(key, tenant).await;
    }

    metrics::record_cache(target_name, RequestKind::Llm, false, tenant);
    if let Some(cost) = cost_usd {
        metrics::record_cost(target_name, tenant, cost);
    }
    let mut meta = make_meta(Some(&provider), Some(&call.model));
    meta.retries = total_retries;
    meta.cost_usd = cost_usd;
    meta.cost_estimate_usd = call.cost_estimate_usd;
    meta.cost_policy_applied = call.cost_policy_applied.clone();
    if call.max_tokens_reduced {
        meta.max_tokens_reduced = Some(true);
        meta.original_max_tokens = call.original_max_tokens;
    }
    metrics::record_request(target_name, RequestKind::Llm, false, "success", tenant, meta.duration_ms);
    tracing::info!(
        request_id,
        target = target_name,
        kind = "llm",
        model = call.model.as_str(),
        outcome = "success",
        latency_ms = meta.duration_ms,
        cost_usd,
        retries = total_retries,
        tenant,
        "proxied llm request"
    );
    ApiResponse::success(result_data, meta)
}
