//! Single-flight coalescing and conflict detection.

use super::common::{post_request, state_from_yaml};
use reliapi_gateway::engine::http::handle_http_proxy;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> String {
    format!(
        r#"
targets:
  api:
    base_url: {}
    cache:
      ttl_s: 300
"#,
        server.uri()
    )
}

#[tokio::test]
async fn concurrent_posts_with_one_key_reach_upstream_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_delay(Duration::from_millis(150))
                .set_body_json(serde_json::json!({"order_id": "ord_1"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let state = state_from_yaml(&config_for(&server));

    let mut handles = Vec::new();
    for i in 0..5 {
        let state = Arc::clone(&state);
        handles.push(tokio::spawn(async move {
            let request = post_request("api", "/orders", "{\"sku\":42}", Some("k1"));
            handle_http_proxy(&state, &request, &format!("req_{i}"), None, "default").await
        }));
    }

    let mut idempotent_hits = 0;
    let mut bodies = Vec::new();
    for handle in handles {
        let response = handle.await.unwrap();
        assert!(response.success, "all coalesced requests succeed");
        if response.meta.idempotent_hit {
            idempotent_hits += 1;
        }
        bodies.push(response.data.unwrap());
    }

    // Exactly one dispatched; the rest observed its result.
    assert_eq!(idempotent_hits, 4);
    for body in &bodies {
        assert_eq!(body["body"]["order_id"], "ord_1");
    }
}

#[tokio::test]
async fn same_key_different_body_is_a_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"ok": true})))
        .mount(&server)
        .await;

    let state = state_from_yaml(&config_for(&server));
    let first = post_request("api", "/orders", "{\"sku\":1}", Some("k1"));
    let response = handle_http_proxy(&state, &first, "req_1", None, "default").await;
    assert!(response.success);

    let second = post_request("api", "/orders", "{\"sku\":2}", Some("k1"));
    let response = handle_http_proxy(&state, &second, "req_2", None, "default").await;
    assert!(!response.success);
    let error = response.error.unwrap();
    assert_eq!(error.code, reliapi_core::ErrorCode::IdempotencyConflict);
    assert_eq!(error.status_code, Some(409));
    assert!(!error.retryable);
}

#[tokio::test]
async fn replay_after_completion_returns_the_stored_result() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"n": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let state = state_from_yaml(&config_for(&server));
    let request = post_request("api", "/orders", "{\"sku\":1}", Some("k1"));

    let first = handle_http_proxy(&state, &request, "req_1", None, "default").await;
    assert!(first.success && !first.meta.idempotent_hit);

    let replay = handle_http_proxy(&state, &request, "req_2", None, "default").await;
    assert!(replay.success);
    assert!(replay.meta.idempotent_hit);
    assert_eq!(replay.data.unwrap(), first.data.unwrap());
}

#[tokio::test]
async fn failure_clears_the_in_progress_marker() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let state = state_from_yaml(&format!(
        r#"
targets:
  api:
    base_url: {}
    retry_matrix:
      "5xx":
        attempts: 1
        backoff: linear
        base: 0.01
        max: 0.01
"#,
        server.uri()
    ));
    let request = post_request("api", "/orders", "{\"sku\":1}", Some("k1"));
    let response = handle_http_proxy(&state, &request, "req_1", None, "default").await;
    assert!(!response.success);

    // The marker is cleared on the failure path, so waiters are not held
    // for the full coalescing budget.
    assert!(!state.idempotency.in_progress("k1", None).await);

    // A replay sees the registration without a result and is told to
    // retry rather than being coalesced into nothing.
    let replay = handle_http_proxy(&state, &request, "req_2", None, "default").await;
    assert!(!replay.success);
    let error = replay.error.unwrap();
    assert_eq!(error.code, reliapi_core::ErrorCode::IdempotencyConflict);
    assert!(error.retryable);
}
