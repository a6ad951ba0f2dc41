//! HTTP surface: proxy endpoints, health probes, metrics exposition.

use crate::config::Tier;
use crate::engine;
use crate::overrides::RouteDecision;
use crate::schemas::{ApiResponse, ErrorDetail, HttpProxyRequest, LlmProxyRequest, Meta};
use crate::state::AppState;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use reliapi_core::{ErrorCode, ErrorKind};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Builds the application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/proxy/http", post(proxy_http))
        .route("/proxy/llm", post(proxy_llm))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
        .route("/metrics", get(metrics_endpoint))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn new_request_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("req_{}", &id[..16])
}

/// Resolved caller identity.
struct Caller {
    tenant: Option<String>,
    tier: Tier,
}

/// Resolves the caller from `X-API-Key`.
///
/// With tenants configured, a missing or unknown key is rejected; without
/// tenants the gateway runs open (single-tenant mode).
fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    request_id: &str,
) -> Result<Caller, Response> {
    if state.config.tenants.is_empty() {
        return Ok(Caller {
            tenant: None,
            tier: Tier::Standard,
        });
    }
    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    match state.tenant_by_api_key(api_key) {
        Some((name, tenant)) => Ok(Caller {
            tenant: Some(name.to_string()),
            tier: tenant.tier,
        }),
        None => {
            let response = ApiResponse::error(
                ErrorDetail::new(
                    ErrorKind::Client,
                    ErrorCode::Unauthorized,
                    "missing or invalid API key",
                )
                .status_code(401),
                Meta::new(request_id),
            );
            Err(envelope_response(response, request_id, &[]))
        }
    }
}

fn resolve_profile_name(state: &AppState, headers: &HeaderMap, tenant: Option<&str>) -> String {
    let header_profile = headers.get("x-client").and_then(|v| v.to_str().ok());
    let tenant_profile = tenant
        .and_then(|t| state.config.tenants.get(t))
        .and_then(|t| t.profile.as_deref());
    state
        .profiles
        .resolve_name(header_profile, tenant_profile)
        .to_string()
}

fn envelope_response(
    response: ApiResponse,
    request_id: &str,
    extra_headers: &[(&'static str, String)],
) -> Response {
    let status =
        StatusCode::from_u16(response.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut headers = HeaderMap::new();
    let mut insert = |name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    };
    insert("x-request-id", request_id.to_string());
    insert("x-cache-hit", response.meta.cache_hit.to_string());
    insert("x-retries", response.meta.retries.to_string());
    insert("x-duration-ms", response.meta.duration_ms.to_string());
    for (name, value) in extra_headers {
        insert(name, value.clone());
    }
    (status, headers, Json(response)).into_response()
}

async fn proxy_http(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<HttpProxyRequest>,
) -> Response {
    let request_id = new_request_id();
    let caller = match authenticate(&state, &headers, &request_id) {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    if caller.tier == Tier::Free && request.idempotency_key.is_some() {
        let response = ApiResponse::error(
            ErrorDetail::new(
                ErrorKind::Client,
                ErrorCode::BadRequest,
                "idempotency keys are not available on the free tier",
            )
            .status_code(403),
            Meta::new(&request_id),
        );
        return envelope_response(response, &request_id, &[]);
    }
    let profile_name = resolve_profile_name(&state, &headers, caller.tenant.as_deref());

    let response = engine::http::handle_http_proxy(
        &state,
        &request,
        &request_id,
        caller.tenant.as_deref(),
        &profile_name,
    )
    .await;
    envelope_response(response, &request_id, &[])
}

async fn proxy_llm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut request): Json<LlmProxyRequest>,
) -> Response {
    let request_id = new_request_id();
    let caller = match authenticate(&state, &headers, &request_id) {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    // External routing overrides apply before any other resolution and
    // are echoed back for correlation.
    let decision = RouteDecision::from_headers(&headers);
    let echo_headers: Vec<(&'static str, String)> = decision
        .as_ref()
        .map(|d| d.response_headers())
        .unwrap_or_default();
    if let Some(decision) = &decision {
        let (target, model) = decision.apply(&request.target, request.model.as_deref(), &state.config);
        request.target = target;
        request.model = model;
    }

    let wants_stream = request.stream.unwrap_or(false);
    if caller.tier == Tier::Free {
        if wants_stream {
            let response = ApiResponse::error(
                ErrorDetail::new(
                    ErrorKind::Client,
                    ErrorCode::StreamingUnsupported,
                    "streaming is not available on the free tier",
                )
                .status_code(403),
                Meta::new(&request_id),
            );
            return envelope_response(response, &request_id, &echo_headers);
        }
        if request.idempotency_key.is_some() {
            let response = ApiResponse::error(
                ErrorDetail::new(
                    ErrorKind::Client,
                    ErrorCode::BadRequest,
                    "idempotency keys are not available on the free tier",
                )
                .status_code(403),
                Meta::new(&request_id),
            );
            return envelope_response(response, &request_id, &echo_headers);
        }
    }

    if wants_stream {
        let frames = engine::stream::handle_llm_stream(
            Arc::clone(&state),
            request,
            request_id.clone(),
            caller.tenant.clone(),
        );
        let stream = frames.map(|frame| {
            Ok::<_, std::convert::Infallible>(
                Event::default().event(frame.name).data(
                    serde_json::to_string(&frame.data).unwrap_or_else(|_| "{}".to_string()),
                ),
            )
        });
        let mut response = Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
        let response_headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response_headers.insert(HeaderName::from_static("x-request-id"), value);
        }
        response_headers.insert(
            HeaderName::from_static("cache-control"),
            HeaderValue::from_static("no-cache"),
        );
        for (name, value) in &echo_headers {
            if let Ok(value) = HeaderValue::from_str(value) {
                response_headers.insert(HeaderName::from_static(name), value);
            }
        }
        return response;
    }

    let profile_name = resolve_profile_name(&state, &headers, caller.tenant.as_deref());
    let mut response = engine::llm::handle_llm_proxy(
        &state,
        &request,
        &request_id,
        caller.tenant.as_deref(),
        caller.tier,
        &profile_name,
        true,
        0,
    )
    .await;
    if let Some(decision) = &decision {
        response.meta.route_decision_id = decision.decision_id.clone();
        response.meta.route_name = decision.route_name.clone();
        response.meta.route_provider_override = decision.provider.clone();
        response.meta.route_model_override = decision.model.clone();
    }
    envelope_response(response, &request_id, &echo_headers)
}

fn probe(state: &AppState, addr: SocketAddr, status: &'static str) -> Response {
    if !state.probe_limiter.check(addr.ip()) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"status": "rate_limited"})),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        Json(json!({"status": status, "version": env!("CARGO_PKG_VERSION")})),
    )
        .into_response()
}

async fn healthz(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    probe(&state, addr, "ok")
}

async fn readyz(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let status = if state.store_degraded { "degraded" } else { "ok" };
    probe(&state, addr, status)
}

async fn livez(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    probe(&state, addr, "ok")
}

async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics_handle {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics exporter not installed",
        )
            .into_response(),
    }
}
