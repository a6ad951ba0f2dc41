//! Cost budget gating on the LLM path.

use super::common::{chat_completion_body, llm_request, state_from_yaml};
use reliapi_gateway::config::Tier;
use reliapi_gateway::engine::llm::handle_llm_proxy;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn hard_cap_rejects_before_any_upstream_call() {
    // No mock mounted: an upstream call would fail the test via the
    // network error envelope instead of BUDGET_EXCEEDED.
    let state = state_from_yaml(
        r#"
targets:
  llm:
    base_url: https://api.openai.com/v1
    llm:
      provider: openai
      default_model: gpt-4
      hard_cost_cap_usd: 0.05
"#,
    );
    let mut request = llm_request("llm", "estimate me");
    // 2000 completion tokens of gpt-4 estimate to $0.12.
    request.max_tokens = Some(2000);

    let response =
        handle_llm_proxy(&state, &request, "req_1", None, Tier::Standard, "default", true, 0).await;

    assert!(!response.success);
    let error = response.error.unwrap();
    assert_eq!(error.code, reliapi_core::ErrorCode::BudgetExceeded);
    assert_eq!(error.status_code, Some(400));
    assert!(!error.retryable);
    assert_eq!(
        response.meta.cost_policy_applied.as_deref(),
        Some("hard_cap_rejected")
    );
    assert!(response.meta.cost_estimate_usd.unwrap() > 0.05);
}

#[tokio::test]
async fn soft_cap_throttles_max_tokens_and_proceeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(chat_completion_body("short answer", 10, 5)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let state = state_from_yaml(&format!(
        r#"
targets:
  llm:
    base_url: {}
    llm:
      provider: openai
      default_model: gpt-4
      soft_cost_cap_usd: 0.03
"#,
        server.uri()
    ));
    let mut request = llm_request("llm", "throttle me");
    request.max_tokens = Some(2000);

    let response =
        handle_llm_proxy(&state, &request, "req_1", None, Tier::Standard, "default", true, 0).await;

    assert!(response.success, "soft cap throttles instead of rejecting");
    assert_eq!(
        response.meta.cost_policy_applied.as_deref(),
        Some("soft_cap_throttled")
    );
    assert_eq!(response.meta.max_tokens_reduced, Some(true));
    assert_eq!(response.meta.original_max_tokens, Some(2000));
    // The re-estimate fits under the cap.
    assert!(response.meta.cost_estimate_usd.unwrap() <= 0.03);

    // The payload sent upstream carried the reduced budget.
    let received = server.received_requests().await.unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert!(payload["max_tokens"].as_u64().unwrap() < 2000);
}

#[tokio::test]
async fn tenant_caps_override_target_caps() {
    let state = state_from_yaml(
        r#"
targets:
  llm:
    base_url: https://api.openai.com/v1
    llm:
      provider: openai
      default_model: gpt-4
      hard_cost_cap_usd: 10.0
tenants:
  thrifty:
    api_key: sk-thrifty
    budget_caps:
      llm:
        hard_cost_cap_usd: 0.01
"#,
    );
    let mut request = llm_request("llm", "tenant override");
    request.max_tokens = Some(2000);

    let response = handle_llm_proxy(
        &state,
        &request,
        "req_1",
        Some("thrifty"),
        Tier::Standard,
        "default",
        true,
        0,
    )
    .await;

    assert!(!response.success);
    assert_eq!(
        response.error.unwrap().code,
        reliapi_core::ErrorCode::BudgetExceeded
    );
}

#[tokio::test]
async fn unpriced_models_bypass_the_gate() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_body("hi", 3, 1)))
        .mount(&server)
        .await;

    let state = state_from_yaml(&format!(
        r#"
targets:
  llm:
    base_url: {}
    llm:
      provider: openai
      default_model: some-unpriced-model
      hard_cost_cap_usd: 0.0001
"#,
        server.uri()
    ));
    let response = handle_llm_proxy(
        &state,
        &llm_request("llm", "no price"),
        "req_1",
        None,
        Tier::Standard,
        "default",
        true,
        0,
    )
    .await;

    assert!(response.success);
    assert_eq!(response.meta.cost_estimate_usd, None);
}
