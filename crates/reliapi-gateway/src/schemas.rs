//! Request and response envelopes for the proxy endpoints.

use reliapi_core::{ErrorCode, ErrorKind};
use reliapi_llm::ChatMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Body of `POST /proxy/http`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpProxyRequest {
    pub target: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub query: Option<Value>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Cache TTL override in seconds; GET/HEAD only.
    #[serde(default)]
    pub cache: Option<u64>,
}

/// Body of `POST /proxy/llm`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmProxyRequest {
    pub target: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub cache: Option<u64>,
}

/// The caller-visible error detail.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: String,
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_key_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            code,
            message: message.into(),
            retryable: kind.default_retryable(),
            target: None,
            status_code: None,
            source: None,
            retry_after_s: None,
            provider_key_status: None,
            hint: None,
            details: None,
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn status_code(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn source(mut self, source: &'static str) -> Self {
        self.source = Some(source);
        self
    }

    pub fn retry_after_s(mut self, seconds: f64) -> Self {
        self.retry_after_s = Some(seconds);
        self
    }

    pub fn provider_key_status(mut self, status: impl Into<String>) -> Self {
        self.provider_key_status = Some(status.into());
        self
    }

    pub fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Response metadata common to both endpoints.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Meta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub cache_hit: bool,
    pub idempotent_hit: bool,
    pub retries: u32,
    pub duration_ms: u64,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_estimate_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_policy_applied: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens_reduced: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_used: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_decision_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_provider_override: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_model_override: Option<String>,
}

impl Meta {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Default::default()
        }
    }
}

/// The unified endpoint response.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub meta: Meta,
}

impl ApiResponse {
    pub fn success(data: Value, meta: Meta) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta,
        }
    }

    pub fn error(error: ErrorDetail, meta: Meta) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            meta,
        }
    }

    /// HTTP status the envelope travels under.
    pub fn http_status(&self) -> u16 {
        match &self.error {
            None => 200,
            Some(error) => error.status_code.unwrap_or(500),
        }
    }
}
