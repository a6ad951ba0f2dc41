//! Cached GET behaviour.

use super::common::{get_request, state_from_yaml};
use reliapi_gateway::engine::http::handle_http_proxy;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> String {
    format!(
        r#"
targets:
  jsonplaceholder:
    base_url: {}
    cache:
      ttl_s: 300
"#,
        server.uri()
    )
}

#[tokio::test]
async fn second_identical_get_is_served_from_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/posts/1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 1, "title": "post"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let state = state_from_yaml(&config_for(&server));
    let request = get_request("jsonplaceholder", "/posts/1", Some(300));

    let first = handle_http_proxy(&state, &request, "req_1", None, "default").await;
    assert!(first.success);
    assert!(!first.meta.cache_hit);
    let first_body = first.data.unwrap();
    assert_eq!(first_body["status_code"], 200);
    assert_eq!(first_body["body"]["id"], 1);

    let second = handle_http_proxy(&state, &request, "req_2", None, "default").await;
    assert!(second.success);
    assert!(second.meta.cache_hit);
    assert_eq!(second.data.unwrap()["body"]["id"], 1);

    // The mock's expect(1) verifies the upstream was not contacted again.
}

#[tokio::test]
async fn post_responses_are_not_cached_on_the_http_path() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": 7})))
        .expect(2)
        .mount(&server)
        .await;

    let state = state_from_yaml(&config_for(&server));
    let request = super::common::post_request("jsonplaceholder", "/orders", "{\"sku\":1}", None);

    let first = handle_http_proxy(&state, &request, "req_1", None, "default").await;
    let second = handle_http_proxy(&state, &request, "req_2", None, "default").await;
    assert!(first.success && second.success);
    assert!(!second.meta.cache_hit);
}

#[tokio::test]
async fn unknown_target_is_not_found() {
    let state = state_from_yaml(
        r#"
targets:
  known:
    base_url: https://example.com
"#,
    );
    let request = get_request("unknown", "/x", None);
    let response = handle_http_proxy(&state, &request, "req_1", None, "default").await;
    assert!(!response.success);
    let error = response.error.unwrap();
    assert_eq!(error.code, reliapi_core::ErrorCode::NotFound);
    assert_eq!(error.status_code, Some(404));
}

#[tokio::test]
async fn upstream_4xx_passes_through_with_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({"error": "no"})))
        .mount(&server)
        .await;

    let state = state_from_yaml(&config_for(&server));
    let request = get_request("jsonplaceholder", "/missing", None);
    let response = handle_http_proxy(&state, &request, "req_1", None, "default").await;

    // Pass-through: the envelope succeeds, the upstream status rides in
    // the data.
    assert!(response.success);
    assert_eq!(response.data.unwrap()["status_code"], 404);
}
