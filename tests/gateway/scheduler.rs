//! Rate-scheduler admission through the proxy pipeline.

use super::common::state_from_yaml;
use reliapi_gateway::engine::http::handle_http_proxy;
use reliapi_gateway::schemas::HttpProxyRequest;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

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
async fn burst_past_the_bucket_rate_returns_gateway_429s() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": 1})))
        .mount(&server)
        .await;

    let state = state_from_yaml(&format!(
        r#"
targets:
  api:
    base_url: {}
    cache:
      enabled: false
provider_key_pools:
  api:
    keys:
      - id: limited
        api_key: sk-limited
        qps_limit: 10
"#,
        server.uri()
    ));

    let mut admitted = 0;
    let mut rejected = Vec::new();
    for i in 0..20 {
        let response =
            handle_http_proxy(&state, &get_request(), &format!("req_{i}"), None, "default").await;
        if response.success {
            admitted += 1;
        } else {
            rejected.push(response);
        }
    }

    // The bucket starts with ~10 tokens; a fast burst admits about that
    // many.
    assert!((10..=12).contains(&admitted), "admitted {admitted}");
    assert!(!rejected.is_empty());
    for response in &rejected {
        let error = response.error.as_ref().unwrap();
        assert_eq!(error.code, reliapi_core::ErrorCode::RateLimitReliapi);
        assert_eq!(error.source, Some("reliapi"));
        assert_eq!(error.status_code, Some(429));
        assert!(error.retryable);
        let retry_after = error.retry_after_s.unwrap();
        assert!(retry_after > 0.0 && retry_after <= 1.0, "retry_after {retry_after}");
    }
}

#[tokio::test]
async fn tenant_rpm_ceiling_feeds_the_tenant_bucket() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": 1})))
        .mount(&server)
        .await;

    // 120 rpm = 2 qps; the tenant bucket admits ~2 in a burst. The
    // provider key is unlimited so the tenant bucket is the limiter.
    let state = state_from_yaml(&format!(
        r#"
targets:
  api:
    base_url: {}
    cache:
      enabled: false
tenants:
  acme:
    api_key: sk-acme
    rate_limit_rpm: 120
provider_key_pools:
  api:
    keys:
      - id: k1
        api_key: sk-1
        qps_limit: 1000
"#,
        server.uri()
    ));

    let mut admitted = 0;
    let mut tenant_limited = 0;
    for i in 0..10 {
        let response = handle_http_proxy(
            &state,
            &get_request(),
            &format!("req_{i}"),
            Some("acme"),
            "default",
        )
        .await;
        if response.success {
            admitted += 1;
        } else {
            let error = response.error.unwrap();
            assert_eq!(error.code, reliapi_core::ErrorCode::RateLimitReliapi);
            if error.message.contains("tenant") {
                tenant_limited += 1;
            }
        }
    }
    assert!((2..=3).contains(&admitted), "admitted {admitted}");
    assert!(tenant_limited >= 7);
}
