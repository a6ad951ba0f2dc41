//! Shared fixtures for the gateway pipeline tests.

use reliapi_gateway::config::load_config_str;
use reliapi_gateway::schemas::{HttpProxyRequest, LlmProxyRequest};
use reliapi_gateway::state::AppState;
use reliapi_store::MemoryStore;
use std::sync::Arc;

/// Builds an in-memory application state from a YAML fragment.
pub fn state_from_yaml(yaml: &str) -> Arc<AppState> {
    let config = load_config_str(yaml).expect("test config must be valid");
    Arc::new(
        AppState::new(config, Arc::new(MemoryStore::new()), false, None)
            .expect("state must build"),
    )
}

/// A minimal GET request against a target.
pub fn get_request(target: &str, path: &str, cache: Option<u64>) -> HttpProxyRequest {
    HttpProxyRequest {
        target: target.to_string(),
        method: "GET".to_string(),
        path: path.to_string(),
        headers: None,
        query: None,
        body: None,
        idempotency_key: None,
        cache,
    }
}

/// A POST request with a body and optional idempotency key.
pub fn post_request(target: &str, path: &str, body: &str, key: Option<&str>) -> HttpProxyRequest {
    HttpProxyRequest {
        target: target.to_string(),
        method: "POST".to_string(),
        path: path.to_string(),
        headers: None,
        query: None,
        body: Some(body.to_string()),
        idempotency_key: key.map(str::to_string),
        cache: None,
    }
}

/// A chat request against an LLM target.
pub fn llm_request(target: &str, content: &str) -> LlmProxyRequest {
    LlmProxyRequest {
        target: target.to_string(),
        messages: vec![reliapi_llm::ChatMessage {
            role: "user".to_string(),
            content: content.to_string(),
        }],
        model: None,
        max_tokens: None,
        temperature: None,
        top_p: None,
        stop: None,
        stream: None,
        idempotency_key: None,
        cache: None,
    }
}

/// An OpenAI-dialect chat completion body with usage.
pub fn chat_completion_body(content: &str, prompt_tokens: u64, completion_tokens: u64) -> serde_json::Value {
    serde_json::json!({
        "choices": [{
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens
        }
    })
}
