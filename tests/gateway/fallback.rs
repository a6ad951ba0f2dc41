//! Fallback-target recursion on the LLM path.

use super::common::{chat_completion_body, llm_request, state_from_yaml};
use reliapi_gateway::config::Tier;
use reliapi_gateway::engine::llm::handle_llm_proxy;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(primary: &MockServer, backup: &MockServer) -> String {
    format!(
        r#"
targets:
  primary:
    base_url: {}
    cache:
      enabled: false
    llm:
      provider: openai
      default_model: gpt-4o-mini
    fallback_targets: [backup]
    retry_matrix:
      "5xx":
        attempts: 1
        backoff: linear
        base: 0.01
        max: 0.01
  backup:
    base_url: {}
    cache:
      enabled: false
    llm:
      provider: mistral
      default_model: mistral-small-latest
"#,
        primary.uri(),
        backup.uri()
    )
}

#[tokio::test]
async fn retryable_failure_recurses_into_the_fallback() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(chat_completion_body("from backup", 8, 2)),
        )
        .expect(1)
        .mount(&backup)
        .await;

    let state = state_from_yaml(&config_for(&primary, &backup));
    let response = handle_llm_proxy(
        &state,
        &llm_request("primary", "hello"),
        "req_1",
        None,
        Tier::Standard,
        "default",
        true,
        0,
    )
    .await;

    assert!(response.success);
    assert_eq!(response.meta.fallback_used, Some(true));
    assert_eq!(response.meta.fallback_target.as_deref(), Some("backup"));
    assert_eq!(response.data.unwrap()["content"], "from backup");
}

#[tokio::test]
async fn free_tier_may_not_chain_fallbacks() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(chat_completion_body("from backup", 8, 2)),
        )
        .expect(0)
        .mount(&backup)
        .await;

    let state = state_from_yaml(&config_for(&primary, &backup));
    let response = handle_llm_proxy(
        &state,
        &llm_request("primary", "hello"),
        "req_1",
        None,
        Tier::Free,
        "default",
        true,
        0,
    )
    .await;

    assert!(!response.success);
    assert_eq!(response.error.unwrap().status_code, Some(503));
    assert_eq!(response.meta.fallback_used, None);
}

#[tokio::test]
async fn non_retryable_failures_do_not_fall_back() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(422).set_body_string("bad request"))
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(chat_completion_body("unused", 1, 1)),
        )
        .expect(0)
        .mount(&backup)
        .await;

    let state = state_from_yaml(&config_for(&primary, &backup));
    let response = handle_llm_proxy(
        &state,
        &llm_request("primary", "hello"),
        "req_1",
        None,
        Tier::Standard,
        "default",
        true,
        0,
    )
    .await;

    assert!(!response.success);
    let error = response.error.unwrap();
    assert_eq!(error.status_code, Some(422));
    assert!(!error.retryable);
}

#[tokio::test]
async fn tenant_fallback_override_wins_over_target_config() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;
    let preferred = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(chat_completion_body("unused", 1, 1)),
        )
        .expect(0)
        .mount(&backup)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(chat_completion_body("from preferred", 8, 2)),
        )
        .expect(1)
        .mount(&preferred)
        .await;

    let state = state_from_yaml(&format!(
        r#"
targets:
  primary:
    base_url: {}
    cache:
      enabled: false
    llm:
      provider: openai
      default_model: gpt-4o-mini
    fallback_targets: [backup]
    retry_matrix:
      "5xx":
        attempts: 1
        backoff: linear
        base: 0.01
        max: 0.01
  backup:
    base_url: {}
    cache:
      enabled: false
    llm:
      provider: mistral
      default_model: mistral-small-latest
  preferred:
    base_url: {}
    cache:
      enabled: false
    llm:
      provider: mistral
      default_model: mistral-small-latest
tenants:
  acme:
    api_key: sk-acme
    fallback_targets:
      primary: [preferred]
"#,
        primary.uri(),
        backup.uri(),
        preferred.uri()
    ));
    let response = handle_llm_proxy(
        &state,
        &llm_request("primary", "hello"),
        "req_1",
        Some("acme"),
        Tier::Standard,
        "default",
        true,
        0,
    )
    .await;

    assert!(response.success);
    assert_eq!(response.meta.fallback_target.as_deref(), Some("preferred"));
}
