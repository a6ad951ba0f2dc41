//! Upstream HTTP client.
//!
//! One client per target, wrapping a pooled transport. Every call first
//! consults the target's circuit breaker, then runs under the target's
//! retry matrix. Success is recorded for statuses below 400; failures
//! are recorded for 5xx, 429, connect errors, and timeouts. Statuses in
//! the 400s other than 429 pass through as responses.

use crate::config::{AuthConfig, TargetConfig};
use reliapi_circuitbreaker::CircuitBreaker;
use reliapi_retry::{retry_after, ErrorClass, RetryEngine, RetryableError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Hop-by-hop headers stripped from pass-through requests.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// A single injected authentication header.
#[derive(Debug, Clone)]
pub struct AuthHeader {
    pub header: String,
    pub prefix: String,
    pub secret: String,
}

impl AuthHeader {
    /// Builds the header from resolved static target auth.
    pub fn from_config(auth: &AuthConfig) -> Option<Self> {
        let secret = auth.api_key.clone()?;
        Some(Self {
            header: auth.header.clone().unwrap_or_else(|| "Authorization".into()),
            prefix: auth.prefix.clone().unwrap_or_else(|| "Bearer ".into()),
            secret,
        })
    }

    /// Standard bearer auth for a pooled provider key.
    pub fn bearer(secret: impl Into<String>) -> Self {
        Self {
            header: "Authorization".into(),
            prefix: "Bearer ".into(),
            secret: secret.into(),
        }
    }

    fn value(&self) -> String {
        format!("{}{}", self.prefix, self.secret)
    }
}

/// A fully-read upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Failures the upstream client surfaces.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The circuit breaker refused the call.
    #[error("circuit open for upstream")]
    CircuitOpen,
    /// The upstream answered 429 or 5xx (after retries).
    #[error("upstream returned {status}")]
    Status {
        status: u16,
        headers: HashMap<String, String>,
        body: Vec<u8>,
        retry_after: Option<Duration>,
    },
    /// The request timed out.
    #[error("upstream timeout: {0}")]
    Timeout(String),
    /// Connect or transport failure.
    #[error("upstream network error: {0}")]
    Network(String),
}

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl RetryableError for UpstreamError {
    fn error_class(&self) -> Option<ErrorClass> {
        match self {
            UpstreamError::Status { status: 429, .. } => Some(ErrorClass::RateLimited),
            UpstreamError::Status { status, .. } if *status >= 500 => Some(ErrorClass::ServerError),
            UpstreamError::Timeout(_) => Some(ErrorClass::Timeout),
            UpstreamError::Network(_) => Some(ErrorClass::Network),
            // An open circuit fails fast; retrying against it is noise.
            _ => None,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            UpstreamError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Per-target upstream client.
pub struct UpstreamClient {
    base_url: String,
    client: reqwest::Client,
    retry: RetryEngine,
    breaker: Arc<CircuitBreaker>,
}

impl UpstreamClient {
    pub fn new(target: &TargetConfig, breaker: Arc<CircuitBreaker>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(20)
            .connect_timeout(Duration::from_secs(5))
            .timeout(target.timeout())
            .build()?;
        Ok(Self {
            base_url: target.base_url.trim_end_matches('/').to_string(),
            client,
            retry: RetryEngine::new(target.retry_matrix()),
            breaker,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The pooled transport, shared with streaming calls.
    pub fn transport(&self) -> &reqwest::Client {
        &self.client
    }

    /// Issues a request under the retry matrix and circuit breaker.
    ///
    /// Returns the response (any status below 500 except 429) or the
    /// final error, plus the number of retries performed.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        headers: Option<&HashMap<String, String>>,
        body: Option<&[u8]>,
        query: Option<&Value>,
        auth: Option<&AuthHeader>,
    ) -> (Result<UpstreamResponse, UpstreamError>, u32) {
        if self.breaker.is_open(&self.base_url) {
            return (Err(UpstreamError::CircuitOpen), 0);
        }
        self.retry
            .execute(|| self.attempt(method, path, headers, body, query, auth))
            .await
    }

    async fn attempt(
        &self,
        method: &str,
        path: &str,
        headers: Option<&HashMap<String, String>>,
        body: Option<&[u8]>,
        query: Option<&Value>,
        auth: Option<&AuthHeader>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|e| UpstreamError::Network(format!("invalid method: {e}")))?;
        let url = format!("{}{path}", self.base_url);
        let mut request = self.client.request(method, url);

        if let Some(headers) = headers {
            for (name, value) in headers {
                let lowered = name.to_ascii_lowercase();
                if HOP_BY_HOP.contains(&lowered.as_str())
                    || lowered == "host"
                    || lowered == "content-length"
                {
                    continue;
                }
                request = request.header(name.as_str(), value.as_str());
            }
        }
        if let Some(auth) = auth {
            request = request.header(auth.header.as_str(), auth.value());
        }
        if let Some(Value::Object(params)) = query {
            let pairs: Vec<(String, String)> = params
                .iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect();
            request = request.query(&pairs);
        }
        if let Some(body) = body {
            request = request.body(body.to_vec());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                self.breaker.record_failure(&self.base_url);
                if err.is_timeout() {
                    return Err(UpstreamError::Timeout(err.to_string()));
                }
                return Err(UpstreamError::Network(err.to_string()));
            }
        };

        let status = response.status().as_u16();
        let response_headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let retry_hint = response_headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
            .and_then(|(_, value)| retry_after::parse(value));

        let body = match response.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(err) => {
                self.breaker.record_failure(&self.base_url);
                if err.is_timeout() {
                    return Err(UpstreamError::Timeout(err.to_string()));
                }
                return Err(UpstreamError::Network(err.to_string()));
            }
        };

        if status == 429 || status >= 500 {
            self.breaker.record_failure(&self.base_url);
            return Err(UpstreamError::Status {
                status,
                headers: response_headers,
                body,
                retry_after: retry_hint,
            });
        }
        if status < 400 {
            self.breaker.record_success(&self.base_url);
        }
        Ok(UpstreamResponse {
            status,
            headers: response_headers,
            body,
        })
    }
}
