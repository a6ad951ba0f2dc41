//! The LLM streaming pipeline.
//!
//! Events are emitted in the order `meta`, zero or more `chunk`s, then
//! one `done`, or a single `error` at any point. The budget gate runs
//! before the upstream stream is opened. A failure after the first chunk
//! has been emitted is terminal: the engine reports
//! `UPSTREAM_STREAM_INTERRUPTED` and never retries mid-stream.

use super::resolve_auth;
use crate::metrics::{self, RequestKind};
use crate::schemas::LlmProxyRequest;
use crate::state::AppState;
use futures::{Stream, StreamExt};
use reliapi_cache::RequestParts;
use reliapi_core::ErrorCode;
use reliapi_idempotency::{request_hash, Registration};
use reliapi_keypool::KeyErrorKind;
use reliapi_llm::{
    AdapterError, ChatParams, CostEstimator, LlmAdapter, StreamChunk, TokenUsage,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// One server-sent event produced by the streaming pipeline, before any
/// wire framing.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub name: &'static str,
    pub data: Value,
}

fn sse_event(name: &'static str, data: Value) -> StreamEvent {
    StreamEvent { name, data }
}

fn error_event(code: ErrorCode, message: String, upstream_status: Option<u16>) -> StreamEvent {
    sse_event(
        "error",
        json!({
            "code": code,
            "message": message,
            "upstream_status": upstream_status,
        }),
    )
}

/// Runs one streaming LLM request, yielding SSE events.
pub fn handle_llm_stream(
    state: Arc<AppState>,
    request: LlmProxyRequest,
    request_id: String,
    tenant: Option<String>,
) -> impl Stream<Item = StreamEvent> {
    async_stream::stream! {
        let started = Instant::now();
        let target_name = request.target.clone();
        let tenant = tenant.as_deref();

        let Some(target) = state.config.targets.get(&target_name) else {
            yield error_event(
                ErrorCode::NotFound,
                format!("target '{target_name}' not found"),
                Some(404),
            );
            return;
        };
        let Some(llm) = target.llm.as_ref() else {
            yield error_event(
                ErrorCode::InvalidTarget,
                format!("target '{target_name}' is not configured for LLM"),
                Some(400),
            );
            return;
        };

        let model = request
            .model
            .clone()
            .or_else(|| llm.default_model.clone())
            .unwrap_or_else(|| "gpt-4".to_string());
        let mut max_tokens = match (request.max_tokens, llm.max_tokens) {
            (Some(requested), Some(ceiling)) => Some(requested.min(ceiling)),
            (requested, ceiling) => requested.or(ceiling),
        };
        let temperature = match (request.temperature, llm.temperature) {
            (Some(requested), Some(ceiling)) => Some(requested.min(ceiling)),
            (requested, ceiling) => requested.or(ceiling),
        };

        let provider = llm
            .provider
            .clone()
            .or_else(|| LlmAdapter::detect_provider(&target.base_url).map(str::to_string));
        let Some(provider) = provider else {
            metrics::record_error(&target_name, RequestKind::Llm, ErrorCode::UnknownProvider, None, tenant);
            yield error_event(
                ErrorCode::UnknownProvider,
                format!("could not determine provider for target '{target_name}'"),
                Some(500),
            );
            return;
        };
        let Some(adapter) = LlmAdapter::for_provider(&provider) else {
            metrics::record_error(&target_name, RequestKind::Llm, ErrorCode::AdapterNotFound, None, tenant);
            yield error_event(
                ErrorCode::AdapterNotFound,
                format!("no adapter for provider '{provider}'"),
                Some(500),
            );
            return;
        };
        if !adapter.supports_streaming() {
            metrics::record_error(&target_name, RequestKind::Llm, ErrorCode::StreamingUnsupported, None, tenant);
            yield error_event(
                ErrorCode::StreamingUnsupported,
                format!("provider '{provider}' does not support streaming"),
                Some(400),
            );
            return;
        }

        // Budget gate; the stream is never opened past a hard cap.
        let tenant_config = tenant.and_then(|t| state.config.tenants.get(t));
        let caps = tenant_config
            .and_then(|t| t.budget_caps.as_ref())
            .and_then(|caps| caps.get(&target_name));
        let hard_cap = caps.and_then(|c| c.hard_cost_cap_usd).or(llm.hard_cost_cap_usd);
        let soft_cap = caps.and_then(|c| c.soft_cost_cap_usd).or(llm.soft_cost_cap_usd);

        let mut cost_estimate =
            CostEstimator::estimate_from_messages(&provider, &model, &request.messages, max_tokens);
        let mut cost_policy = "none".to_string();
        let mut max_tokens_reduced = false;
        let mut original_max_tokens = None;

        if let (Some(cap), Some(estimate)) = (hard_cap, cost_estimate) {
            if estimate > cap {
                metrics::record_budget_event(&target_name, "hard_cap", tenant);
                metrics::record_error(&target_name, RequestKind::Llm, ErrorCode::BudgetExceeded, None, tenant);
                yield error_event(
                    ErrorCode::BudgetExceeded,
                    format!("estimated cost ${estimate:.6} exceeds hard cap ${cap:.6}"),
                    Some(400),
                );
                return;
            }
        }
        if let (Some(cap), Some(estimate)) = (soft_cap, cost_estimate) {
            if estimate > cap {
                let prompt_chars: u64 =
                    request.messages.iter().map(|m| m.content.len() as u64).sum();
                let budget_base = max_tokens.unwrap_or(((prompt_chars / 4) / 2).max(1) as u32);
                let factor = cap / estimate;
                original_max_tokens = max_tokens;
                max_tokens = Some(((f64::from(budget_base) * factor * 0.9) as u32).max(1));
                max_tokens_reduced = true;
                cost_policy = "soft_cap_throttled".to_string();
                metrics::record_budget_event(&target_name, "soft_cap", tenant);
                cost_estimate = CostEstimator::estimate_from_messages(
                    &provider,
                    &model,
                    &request.messages,
                    max_tokens,
                );
            }
        }

        let payload = adapter.prepare_request(ChatParams {
            messages: &request.messages,
            model: &model,
            max_tokens,
            temperature,
            top_p: request.top_p,
            stop: request.stop.as_deref(),
            stream: true,
        });
        let payload_bytes = serde_json::to_vec(&payload).unwrap_or_default();
        let api_path = adapter.api_path();
        let full_url = format!("{}{api_path}", target.base_url.trim_end_matches('/'));

        // Streaming idempotency: concurrent streams and completed streams
        // are rejected, never coalesced.
        let mut marked_in_progress = false;
        if let Some(key) = request.idempotency_key.as_deref() {
            let hash = request_hash("POST", &full_url, None, Some(&payload_bytes));
            match state.idempotency.register(key, &hash, &request_id, tenant).await {
                Registration::Conflict { .. } => {
                    yield error_event(
                        ErrorCode::IdempotencyConflict,
                        format!("idempotency key '{key}' used with a different request"),
                        Some(409),
                    );
                    return;
                }
                Registration::Existing { .. } => {
                    if state.idempotency.result(key, tenant).await.is_some() {
                        yield error_event(
                            ErrorCode::StreamAlreadyCompleted,
                            format!(
                                "stream already completed for idempotency key '{key}'; use a non-streaming request for the stored result"
                            ),
                            Some(409),
                        );
                        return;
                    }
                    if state.idempotency.in_progress(key, tenant).await {
                        yield error_event(
                            ErrorCode::StreamAlreadyInProgress,
                            format!("stream already in progress for idempotency key '{key}'"),
                            Some(409),
                        );
                        return;
                    }
                }
                Registration::New => {}
            }
            state.idempotency.mark_in_progress(key, tenant).await;
            marked_in_progress = true;
        }

        let mut meta = json!({
            "target": target_name.clone(),
            "provider": provider.clone(),
            "model": model.clone(),
            "request_id": request_id.clone(),
            "cost_estimate_usd": cost_estimate,
            "cost_policy_applied": cost_policy.clone(),
        });
        if max_tokens_reduced {
            meta["max_tokens_reduced"] = json!(true);
            meta["original_max_tokens"] = json!(original_max_tokens);
        }
        yield sse_event("meta", meta);

        // Credentials: pooled key or static target auth; no mid-stream
        // key switching.
        let resolved = resolve_auth(&state, target, &provider, None);
        let mut headers = HashMap::new();
        if let Some(auth) = &resolved.auth {
            headers.insert(auth.header.clone(), format!("{}{}", auth.prefix, auth.secret));
        }
        let selected_key = resolved.key;

        let transport = state
            .client(&target_name)
            .expect("client exists for every configured target")
            .transport();
        let mut chunks = adapter.stream_chat(transport, &target.base_url, api_path, payload, &headers);

        let mut content = String::new();
        let mut usage = TokenUsage::default();
        let mut finish_reason: Option<String> = None;
        let mut stream_started = false;
        let mut failed = false;

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(StreamChunk::Delta(delta)) => {
                    stream_started = true;
                    content.push_str(&delta);
                    yield sse_event(
                        "chunk",
                        json!({"delta": delta, "finish_reason": null}),
                    );
                }
                Ok(StreamChunk::Finish(reason)) => {
                    stream_started = true;
                    finish_reason = Some(reason);
                }
                Ok(StreamChunk::Usage(reported)) => {
                    stream_started = true;
                    usage.merge(reported);
                }
                Err(err) => {
                    failed = true;
                    let upstream_status = err.status();
                    if let Some(key) = &selected_key {
                        let kind = upstream_status
                            .map(KeyErrorKind::from_status)
                            .unwrap_or(KeyErrorKind::Network);
                        state.key_pool.record_error(&key.id, kind);
                    }
                    let (code, message) = if stream_started {
                        (
                            ErrorCode::UpstreamStreamInterrupted,
                            format!("upstream stream interrupted: {err}"),
                        )
                    } else {
                        match &err {
                            AdapterError::Upstream { status, .. } => (
                                ErrorCode::from_http_status(*status),
                                format!("upstream returned {status}"),
                            ),
                            AdapterError::Transport(e) => (
                                ErrorCode::NetworkError,
                                format!("network error: {e}"),
                            ),
                            AdapterError::Decode(message) => (
                                ErrorCode::ProviderError,
                                format!("provider stream not understood: {message}"),
                            ),
                        }
                    };
                    metrics::record_error(&target_name, RequestKind::Llm, code, upstream_status, tenant);
                    yield error_event(code, message, upstream_status.or(Some(502)));
                    break;
                }
            }
        }

        if marked_in_progress {
            if let Some(key) = request.idempotency_key.as_deref() {
                state.idempotency.clear_in_progress(key, tenant).await;
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        if failed {
            metrics::record_request(&target_name, RequestKind::Llm, true, "error", tenant, duration_ms);
            tracing::error!(
                request_id = request_id.as_str(),
                target = target_name.as_str(),
                kind = "llm",
                stream = true,
                model = model.as_str(),
                outcome = "error",
                latency_ms = duration_ms,
                tenant,
                "proxied llm stream"
            );
            return;
        }

        if let Some(key) = &selected_key {
            state.key_pool.record_success(&key.id);
        }

        // Zero-chunk completions are valid; cost degenerates to the
        // prompt-only cost.
        let finish_reason = finish_reason.unwrap_or_else(|| "stop".to_string());
        let cost_usd = adapter.cost_usd(&model, usage);
        let usage_json = json!({
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total(),
        });
        yield sse_event(
            "done",
            json!({
                "finish_reason": finish_reason.clone(),
                "usage": usage_json.clone(),
                "cost_usd": cost_usd,
            }),
        );

        // Persist the aggregate exactly as the non-streaming path would.
        let result_data = json!({
            "content": content,
            "role": "assistant",
            "finish_reason": finish_reason,
            "usage": usage_json,
        });
        let tenant_ttl = tenant_config
            .and_then(|t| t.cache_ttl_override.as_ref())
            .and_then(|o| o.get(&target_name))
            .copied();
        let cache_ttl = target.cache_ttl(request.cache, tenant_ttl);
        if target.cache.enabled {
            // The non-streaming payload is the cache identity, so a
            // later non-streaming call with the same request hits this
            // entry.
            let lookup_payload = adapter.prepare_request(ChatParams {
                messages: &request.messages,
                model: &model,
                max_tokens,
                temperature,
                top_p: request.top_p,
                stop: request.stop.as_deref(),
                stream: false,
            });
            let lookup_bytes = serde_json::to_vec(&lookup_payload).unwrap_or_default();
            let parts = RequestParts {
                method: "POST",
                url: &full_url,
                headers: None,
                body: Some(&lookup_bytes),
                query: None,
            };
            state
                .cache
                .set(
                    parts,
                    &json!({"body": result_data.clone(), "cost_usd": cost_usd}),
                    cache_ttl,
                    true,
                    tenant,
                )
                .await;
        }
        if let Some(key) = request.idempotency_key.as_deref() {
            state
                .idempotency
                .store_result(
                    key,
                    &json!({"data": result_data, "cost_usd": cost_usd}),
                    cache_ttl,
                    tenant,
                )
                .await;
        }

        metrics::record_request(&target_name, RequestKind::Llm, true, "success", tenant, duration_ms);
        if let Some(cost) = cost_usd {
            metrics::record_cost(&target_name, tenant, cost);
        }
        tracing::info!(
            request_id = request_id.as_str(),
            target = target_name.as_str(),
            kind = "llm",
            stream = true,
            model = model.as_str(),
            outcome = "success",
            latency_ms = duration_ms,
            cost_usd,
            tenant,
            "proxied llm stream"
        );
    }
}
