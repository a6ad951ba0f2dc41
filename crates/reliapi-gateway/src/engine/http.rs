//! The HTTP-generic proxy pipeline.

use super::{build_admission, resolve_auth, upstream_error_detail, KeySwitchState};
use crate::metrics::{self, RequestKind};
use crate::schemas::{ApiResponse, ErrorDetail, HttpProxyRequest, Meta};
use crate::state::AppState;
use crate::upstream::{AuthHeader, UpstreamError};
use reliapi_cache::RequestParts;
use reliapi_core::{ErrorCode, ErrorKind};
use reliapi_idempotency::{request_hash, Registration};
use reliapi_keypool::KeyErrorKind;
use std::time::Instant;

/// Handles one `POST /proxy/http` request end to end.
pub async fn handle_http_proxy(
    state: &AppState,
    request: &HttpProxyRequest,
    request_id: &str,
    tenant: Option<&str>,
    profile_name: &str,
) -> ApiResponse {
    let started = Instant::now();
    let target_name = request.target.as_str();
    let method = request.method.to_ascii_uppercase();

    let make_meta = |cache_hit: bool, idempotent_hit: bool, retries: u32, started: Instant| {
        let mut meta = Meta::new(request_id);
        meta.target = Some(target_name.to_string());
        meta.cache_hit = cache_hit;
        meta.idempotent_hit = idempotent_hit;
        meta.retries = retries;
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
            make_meta(false, false, 0, started),
        );
    };

    let full_url = format!("{}{}", target.base_url.trim_end_matches('/'), request.path);
    let body_bytes = request.body.as_ref().map(|b| b.clone().into_bytes());
    let tenant_config = tenant.and_then(|t| state.config.tenants.get(t));
    let tenant_ttl = tenant_config
        .and_then(|t| t.cache_ttl_override.as_ref())
        .and_then(|o| o.get(target_name))
        .copied();
    let cache_ttl = target.cache_ttl(request.cache, tenant_ttl);

    let cache_parts = RequestParts {
        method: &method,
        url: &full_url,
        headers: request.headers.as_ref(),
        body: body_bytes.as_deref(),
        query: request.query.as_ref(),
    };

    // Cache lookup, GET/HEAD only.
    if matches!(method.as_str(), "GET" | "HEAD") && target.cache.enabled {
        if let Some(cached) = state.cache.get(cache_parts, false, tenant).await {
            metrics::record_cache(target_name, RequestKind::Http, true, tenant);
            let meta = make_meta(true, false, 0, started);
            log_outcome(request_id, target_name, &request.path, "success", &meta, None, None, tenant);
            metrics::record_request(target_name, RequestKind::Http, false, "success", tenant, meta.duration_ms);
            return ApiResponse::success(cached, meta);
        }
    }

    // Idempotency for mutating methods.
    let idempotency_key = request
        .idempotency_key
        .as_deref()
        .filter(|_| matches!(method.as_str(), "POST" | "PUT" | "PATCH"));
    let mut marked_in_progress = false;
    if let Some(key) = idempotency_key {
        let hash = request_hash(
            &method,
            &full_url,
            request.headers.as_ref(),
            body_bytes.as_deref(),
        );
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
                        format!("idempotency key '{key}' used with a different request body"),
                    )
                    .status_code(409)
                    .target(target_name)
                    .details(serde_json::json!({"existing_request_id": existing_request_id})),
                    make_meta(false, false, 0, started),
                );
            }
            Registration::Existing { .. } => {
                if let Some(result) = state.idempotency.result(key, tenant).await {
                    let meta = make_meta(false, true, 0, started);
                    metrics::record_idempotent_hit(target_name, RequestKind::Http, tenant);
                    log_outcome(request_id, target_name, &request.path, "success", &meta, None, None, tenant);
                    metrics::record_request(target_name, RequestKind::Http, false, "success", tenant, meta.duration_ms);
                    return ApiResponse::success(result, meta);
                }
                // Coalesce behind the in-flight winner.
                match state.idempotency.wait_for_result(key, tenant).await {
                    Some(result) => {
                        let meta = make_meta(false, true, 0, started);
                        metrics::record_idempotent_hit(target_name, RequestKind::Http, tenant);
                        log_outcome(request_id, target_name, &request.path, "success", &meta, None, None, tenant);
                        metrics::record_request(target_name, RequestKind::Http, false, "success", tenant, meta.duration_ms);
                        return ApiResponse::success(result, meta);
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
                            make_meta(false, false, 0, started),
                        );
                    }
                }
            }
        }
    }

    // Credentials: pooled key when the provider has one, else static.
    let provider = target
        .llm
        .as_ref()
        .and_then(|llm| llm.provider.clone())
        .unwrap_or_else(|| target_name.to_string());
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

    // Scheduler admission.
    if let Err(rejection) = state.scheduler.check_rate_limit(admission).await {
        metrics::record_rate_limited(rejection.bucket.as_str());
        if marked_in_progress {
            if let Some(key) = idempotency_key {
                state.idempotency.clear_in_progress(key, tenant).await;
            }
        }
        return ApiResponse::error(
            ErrorDetail::new(
                ErrorKind::RateLimit,
                ErrorCode::RateLimitReliapi,
                format!("rate limit exceeded ({})", rejection.bucket.as_str()),
            )
            .status_code(429)
            .source("reliapi")
            .retry_after_s(rejection.retry_after.as_secs_f64())
            .target(target_name)
            .hint("the upstream provider is being protected"),
            make_meta(false, false, 0, started),
        );
    }

    // Concurrency gate; permits release when the guard drops.
    let _slots = state.scheduler.acquire_slots(admission).await;

    let client = state
        .client(target_name)
        .expect("client exists for every configured target");

    let (mut result, retries) = client
        .request(
            &method,
            &request.path,
            request.headers.as_ref(),
            body_bytes.as_deref(),
            request.query.as_ref(),
            current_auth.as_ref(),
        )
        .await;
    let mut total_retries = retries;

    // Key switching on retryable upstream failures. Each switch burns
    // one unit of the per-request budget and excludes the failed key
    // from re-selection.
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
                &method,
                &request.path,
                request.headers.as_ref(),
                body_bytes.as_deref(),
                request.query.as_ref(),
                current_auth.as_ref(),
            )
            .await;
        total_retries += retries + 1;
        result = next;
    }

    match result {
        Ok(response) => {
            if let Some(key) = &current_key {
                state.key_pool.record_success(&key.id);
            }
            let body_json: serde_json::Value = if response.body.is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_slice(&response.body).unwrap_or_else(|_| {
                    serde_json::json!({"raw": String::from_utf8_lossy(&response.body)})
                })
            };
            let result_data = serde_json::json!({
                "status_code": response.status,
                "headers": response.headers,
                "body": body_json,
            });

            if matches!(method.as_str(), "GET" | "HEAD")
                && response.status < 400
                && target.cache.enabled
            {
                state
                    .cache
                    .set(cache_parts, &result_data, cache_ttl, false, tenant)
                    .await;
            }
            if let Some(key) = idempotency_key {
                state
                    .idempotency
                    .store_result(key, &result_data, cache_ttl, tenant)
                    .await;
                state.idempotency.clear_in_progress(key, tenant).await;
            }

            metrics::record_cache(target_name, RequestKind::Http, false, tenant);
            let meta = make_meta(false, false, total_retries, started);
            log_outcome(request_id, target_name, &request.path, "success", &meta, None, None, tenant);
            metrics::record_request(target_name, RequestKind::Http, false, "success", tenant, meta.duration_ms);
            ApiResponse::success(result_data, meta)
        }
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
            let meta = make_meta(false, false, total_retries, started);
            metrics::record_error(target_name, RequestKind::Http, detail.code, err.status(), tenant);
            log_outcome(
                request_id,
                target_name,
                &request.path,
                "error",
                &meta,
                Some(detail.code),
                err.status(),
                tenant,
            );
            metrics::record_request(target_name, RequestKind::Http, false, "error", tenant, meta.duration_ms);
            ApiResponse::error(detail, meta)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn log_outcome(
    request_id: &str,
    target: &str,
    path: &str,
    outcome: &'static str,
    meta: &Meta,
    error_code: Option<ErrorCode>,
    upstream_status: Option<u16>,
    tenant: Option<&str>,
) {
    if outcome == "error" {
        tracing::error!(
            request_id,
            target,
            kind = "http",
            path,
            outcome,
            latency_ms = meta.duration_ms,
            cache_hit = meta.cache_hit,
            idempotent_hit = meta.idempotent_hit,
            retries = meta.retries,
            error_code = error_code.map(|c| c.as_str()),
            upstream_status,
            tenant,
            "proxied http request"
        );
    } else {
        tracing::info!(
            request_id,
            target,
            kind = "http",
            path,
            outcome,
            latency_ms = meta.duration_ms,
            cache_hit = meta.cache_hit,
            idempotent_hit = meta.idempotent_hit,
            retries = meta.retries,
            tenant,
            "proxied http request"
        );
    }
}
