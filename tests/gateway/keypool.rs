//! Key-pool selection and per-request key switching.

use super::common::state_from_yaml;
use reliapi_gateway::engine::http::handle_http_proxy;
use reliapi_gateway::schemas::HttpProxyRequest;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> String {
    format!(
        r#"
targets:
  api:
    base_url: {}
    cache:
      enabled: false
    retry_matrix:
      "429":
        attempts: 1
        backoff: linear
        base: 0.01
        max: 0.01
      "5xx":
        attempts: 1
        backoff: linear
        base: 0.01
        max: 0.01
provider_key_pools:
  api:
    keys:
      - id: key-1
        api_key: sk-1
      - id: key-2
        api_key: sk-2
      - id: key-3
        api_key: sk-3
"#,
        server.uri()
    )
}

fn get_request() -> HttpProxyRequest {
    HttpProxyRequest {
        target: "api".to_string(),
        method: "GET".to_string(),
        path: "/data".to_string(),
        headers: None,
        query: None,
        body: None,
        idempotency_key: None,
        cache: None,
    }
}

#[tokio::test]
async fn switches_key_once_on_429_and_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .and(header("Authorization", "Bearer sk-1"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .and(header("Authorization", "Bearer sk-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let state = state_from_yaml(&config_for(&server));
    let response = handle_http_proxy(&state, &get_request(), "req_1", None, "default").await;

    assert!(response.success, "retry with a fresh key succeeds");
    assert_eq!(response.meta.retries, 1);
    assert_eq!(response.data.unwrap()["body"]["ok"], true);
}

#[tokio::test]
async fn key_switching_stops_when_the_pool_is_spent() {
    let server = MockServer::start().await;
    // Every key is rate limited; the request burns through the pool and
    // stops at MAX_KEY_SWITCHES.
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let state = state_from_yaml(&config_for(&server));
    let response = handle_http_proxy(&state, &get_request(), "req_1", None, "default").await;

    assert!(!response.success);
    let error = response.error.unwrap();
    assert_eq!(error.status_code, Some(429));
    assert!(error.retryable);
    // One initial dispatch plus at most three switches, pool size
    // permitting.
    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 3, "pool of three keys tried once each");
}

#[tokio::test]
async fn consecutive_failures_degrade_the_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let state = state_from_yaml(&format!(
        r#"
targets:
  api:
    base_url: {}
    cache:
      enabled: false
    retry_matrix:
      "5xx":
        attempts: 1
        backoff: linear
        base: 0.01
        max: 0.01
provider_key_pools:
  api:
    keys:
      - id: solo
        api_key: sk-solo
"#,
        server.uri()
    ));

    for i in 0..5 {
        let response =
            handle_http_proxy(&state, &get_request(), &format!("req_{i}"), None, "default").await;
        assert!(!response.success);
    }
    let health = state.key_pool.pool_health("api").unwrap();
    assert_eq!(health.degraded, 1);
    assert!(health.is_exhausted);
}
