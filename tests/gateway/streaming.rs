//! Streaming LLM path: event ordering and post-stream persistence.

use super::common::{llm_request, state_from_yaml};
use futures::StreamExt;
use reliapi_gateway::config::Tier;
use reliapi_gateway::engine::llm::handle_llm_proxy;
use reliapi_gateway::engine::stream::{handle_llm_stream, StreamEvent};
use reliapi_gateway::schemas::LlmProxyRequest;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> String {
    format!(
        r#"
targets:
  llm:
    base_url: {}
    cache:
      ttl_s: 300
    llm:
      provider: openai
      default_model: gpt-4o-mini
"#,
        server.uri()
    )
}

fn stream_request(content: &str) -> LlmProxyRequest {
    let mut request = llm_request("llm", content);
    request.model = Some("gpt-4o-mini".to_string());
    request.max_tokens = Some(64);
    request.stream = Some(true);
    request
}

async fn collect(
    state: Arc<reliapi_gateway::state::AppState>,
    request: LlmProxyRequest,
    request_id: &str,
) -> Vec<StreamEvent> {
    handle_llm_stream(state, request, request_id.to_string(), None)
        .collect()
        .await
}

const SSE_BODY: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"},\"finish_reason\":null}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\", \"},\"finish_reason\":null}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"world\"},\"finish_reason\":null}]}\n\n",
    "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
    "data: [DONE]\n\n",
    "data: {\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":3}}\n\n",
);

#[tokio::test]
async fn happy_path_emits_meta_chunks_done_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(SSE_BODY, "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let state = state_from_yaml(&config_for(&server));
    let events = collect(Arc::clone(&state), stream_request("stream me"), "req_1").await;

    assert_eq!(events.first().unwrap().name, "meta");
    let meta = &events[0].data;
    assert_eq!(meta["target"], "llm");
    assert_eq!(meta["provider"], "openai");
    assert_eq!(meta["model"], "gpt-4o-mini");
    assert_eq!(meta["request_id"], "req_1");
    assert_eq!(meta["cost_policy_applied"], "none");

    let chunks: Vec<&StreamEvent> = events.iter().filter(|e| e.name == "chunk").collect();
    assert_eq!(chunks.len(), 3);
    let content: String = chunks
        .iter()
        .map(|c| c.data["delta"].as_str().unwrap())
        .collect();
    assert_eq!(content, "Hello, world");

    let done = events.last().unwrap();
    assert_eq!(done.name, "done");
    assert_eq!(done.data["finish_reason"], "stop");
    assert_eq!(done.data["usage"]["prompt_tokens"], 12);
    assert_eq!(done.data["usage"]["completion_tokens"], 3);
    assert_eq!(done.data["usage"]["total_tokens"], 15);
    assert!(done.data["cost_usd"].as_f64().unwrap() > 0.0);

    // The aggregated content is stored under the non-streaming payload
    // identity: an identical non-streaming request is a cache hit and
    // never reaches the upstream (the mock's expect(1) enforces that).
    let mut follow_up = stream_request("stream me");
    follow_up.stream = Some(false);
    let response = handle_llm_proxy(
        &state,
        &follow_up,
        "req_2",
        None,
        Tier::Standard,
        "default",
        true,
        0,
    )
    .await;
    assert!(response.success);
    assert!(response.meta.cache_hit);
    assert_eq!(response.data.unwrap()["content"], "Hello, world");
}

#[tokio::test]
async fn zero_chunk_completion_still_reports_usage_and_cost() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
        "data: {\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":0}}\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(body, "text/event-stream"),
        )
        .mount(&server)
        .await;

    let state = state_from_yaml(&config_for(&server));
    let events = collect(state, stream_request("empty"), "req_1").await;

    assert!(events.iter().all(|e| e.name != "chunk"));
    let done = events.last().unwrap();
    assert_eq!(done.name, "done");
    assert_eq!(done.data["usage"]["completion_tokens"], 0);
    // Prompt-only cost, non-negative.
    let cost = done.data["cost_usd"].as_f64().unwrap();
    assert!(cost >= 0.0);
    let prompt_only =
        reliapi_llm::CostEstimator::actual_cost("openai", "gpt-4o-mini", 9, 0).unwrap();
    assert!((cost - prompt_only).abs() < 1e-12);
}

#[tokio::test]
async fn upstream_failure_before_first_chunk_is_a_plain_error_event() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let state = state_from_yaml(&config_for(&server));
    let events = collect(state, stream_request("fail"), "req_1").await;

    // meta is emitted before the upstream dial, then a single error.
    assert_eq!(events[0].name, "meta");
    let error = events.last().unwrap();
    assert_eq!(error.name, "error");
    assert_eq!(error.data["code"], "SERVER_ERROR");
    assert_eq!(error.data["upstream_status"], 500);
    assert_eq!(events.iter().filter(|e| e.name == "error").count(), 1);
}

#[tokio::test]
async fn concurrent_stream_with_same_key_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(SSE_BODY, "text/event-stream")
                .set_delay(std::time::Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let state = state_from_yaml(&config_for(&server));
    let mut first_request = stream_request("same");
    first_request.idempotency_key = Some("stream-k1".to_string());
    let second_request = first_request.clone();

    let first_state = Arc::clone(&state);
    let first = tokio::spawn(async move {
        collect(first_state, first_request, "req_1").await
    });
    // Give the first stream time to register and mark in progress.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let second = collect(Arc::clone(&state), second_request, "req_2").await;
    let error = second.last().unwrap();
    assert_eq!(error.name, "error");
    assert_eq!(error.data["code"], "STREAM_ALREADY_IN_PROGRESS");

    let first_events = first.await.unwrap();
    assert_eq!(first_events.last().unwrap().name, "done");

    // Replays after completion are told the stream already finished.
    let mut replay_request = stream_request("same");
    replay_request.idempotency_key = Some("stream-k1".to_string());
    let replay = collect(state, replay_request, "req_3").await;
    assert_eq!(
        replay.last().unwrap().data["code"],
        "STREAM_ALREADY_COMPLETED"
    );
}

#[tokio::test]
async fn hard_cap_refuses_before_opening_the_stream() {
    // No mock: the gate must reject before any upstream dial.
    let state = state_from_yaml(
        r#"
targets:
  llm:
    base_url: https://api.openai.com/v1
    llm:
      provider: openai
      default_model: gpt-4
      hard_cost_cap_usd: 0.01
"#,
    );
    let mut request = stream_request("over budget");
    request.model = Some("gpt-4".to_string());
    request.max_tokens = Some(4000);

    let events = collect(state, request, "req_1").await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name, "error");
    assert_eq!(events[0].data["code"], "BUDGET_EXCEEDED");
}
