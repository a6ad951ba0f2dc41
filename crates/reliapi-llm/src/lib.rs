//! LLM provider adapters.
//!
//! Three provider families are supported: OpenAI, Anthropic, and Mistral.
//! Adapters are variants of one sum type with a shared operation set
//! (request shaping, response parsing, streaming normalisation, and cost
//! lookup), selected by provider name or base-URL inspection, never by
//! registration.
//!
//! Upstream bodies are normalised into [`NormalizedResponse`] at the
//! adapter boundary; raw provider JSON never crosses it. Streaming
//! responses are re-framed into [`StreamChunk`]s: content deltas, a
//! finish marker, and usage-only sentinels that some providers send after
//! the content.

mod anthropic;
pub mod cost;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use cost::CostEstimator;
pub use openai::{MistralAdapter, OpenAiAdapter};

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Parameters for one chat completion call, after config ceilings have
/// been applied.
#[derive(Debug, Clone, Copy)]
pub struct ChatParams<'a> {
    pub messages: &'a [ChatMessage],
    pub model: &'a str,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop: Option<&'a [String]>,
    pub stream: bool,
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Merges a later usage report into this one, keeping the larger
    /// value per field. Providers split usage across chunks (prompt
    /// tokens at stream start, completion tokens at the end).
    pub fn merge(&mut self, other: TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.max(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.max(other.completion_tokens);
    }
}

/// A provider response normalised to a common shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResponse {
    pub content: String,
    pub role: String,
    pub finish_reason: String,
    pub usage: Option<TokenUsage>,
}

/// One normalised streaming chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// A content delta.
    Delta(String),
    /// The provider signalled completion with a finish reason.
    Finish(String),
    /// A usage-only sentinel, possibly sent outside the content flow.
    Usage(TokenUsage),
}

/// Adapter failures.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The provider answered with an HTTP error before or while opening
    /// the stream.
    #[error("provider returned {status}")]
    Upstream { status: u16, body: String },
    /// Transport failure talking to the provider.
    #[error("provider transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The provider sent a body the adapter cannot interpret.
    #[error("provider response not understood: {0}")]
    Decode(String),
}

impl AdapterError {
    /// The upstream HTTP status, when there is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            AdapterError::Upstream { status, .. } => Some(*status),
            AdapterError::Transport(err) => err.status().map(|s| s.as_u16()),
            AdapterError::Decode(_) => None,
        }
    }
}

/// Stream of normalised chunks.
pub type ChunkStream = BoxStream<'static, Result<StreamChunk, AdapterError>>;

/// The adapter sum type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmAdapter {
    OpenAi(OpenAiAdapter),
    Anthropic(AnthropicAdapter),
    Mistral(MistralAdapter),
}

impl LlmAdapter {
    /// Resolves an adapter by provider name.
    pub fn for_provider(provider: &str) -> Option<Self> {
        match provider.to_ascii_lowercase().as_str() {
            "openai" => Some(LlmAdapter::OpenAi(OpenAiAdapter)),
            "anthropic" => Some(LlmAdapter::Anthropic(AnthropicAdapter)),
            "mistral" => Some(LlmAdapter::Mistral(MistralAdapter)),
            _ => None,
        }
    }

    /// Guesses the provider from an upstream base URL.
    pub fn detect_provider(base_url: &str) -> Option<&'static str> {
        let url = base_url.to_ascii_lowercase();
        if url.contains("openai.com") {
            Some("openai")
        } else if url.contains("anthropic.com") {
            Some("anthropic")
        } else if url.contains("mistral.ai") {
            Some("mistral")
        } else {
            None
        }
    }

    /// The provider name this adapter serves.
    pub fn provider(&self) -> &'static str {
        match self {
            LlmAdapter::OpenAi(_) => "openai",
            LlmAdapter::Anthropic(_) => "anthropic",
            LlmAdapter::Mistral(_) => "mistral",
        }
    }

    /// Chat-completion path appended to the target base URL.
    pub fn api_path(&self) -> &'static str {
        match self {
            LlmAdapter::Anthropic(_) => "/messages",
            LlmAdapter::OpenAi(_) | LlmAdapter::Mistral(_) => "/chat/completions",
        }
    }

    /// Builds the provider-specific request payload.
    pub fn prepare_request(&self, params: ChatParams<'_>) -> Value {
        match self {
            LlmAdapter::OpenAi(a) => a.prepare_request(params),
            LlmAdapter::Anthropic(a) => a.prepare_request(params),
            LlmAdapter::Mistral(a) => a.prepare_request(params),
        }
    }

    /// Parses a non-streaming provider response.
    pub fn parse_response(&self, response: &Value) -> Result<NormalizedResponse, AdapterError> {
        match self {
            LlmAdapter::OpenAi(a) => a.parse_response(response),
            LlmAdapter::Anthropic(a) => a.parse_response(response),
            LlmAdapter::Mistral(a) => a.parse_response(response),
        }
    }

    /// Realised cost from actual token usage, if the model is priced.
    pub fn cost_usd(&self, model: &str, usage: TokenUsage) -> Option<f64> {
        CostEstimator::actual_cost(
            self.provider(),
            model,
            usage.prompt_tokens,
            usage.completion_tokens,
        )
    }

    /// Whether the adapter implements streaming.
    pub fn supports_streaming(&self) -> bool {
        match self {
            LlmAdapter::OpenAi(_) | LlmAdapter::Anthropic(_) | LlmAdapter::Mistral(_) => true,
        }
    }

    /// Opens a streaming chat completion and yields normalised chunks.
    pub fn stream_chat(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        path: &str,
        payload: Value,
        headers: &HashMap<String, String>,
    ) -> ChunkStream {
        match self {
            LlmAdapter::OpenAi(a) => a.stream_chat(client, base_url, path, payload, headers),
            LlmAdapter::Anthropic(a) => a.stream_chat(client, base_url, path, payload, headers),
            LlmAdapter::Mistral(a) => a.stream_chat(client, base_url, path, payload, headers),
        }
    }
}

pub(crate) fn send_stream_request(
    client: &reqwest::Client,
    base_url: &str,
    path: &str,
    payload: &Value,
    headers: &HashMap<String, String>,
) -> reqwest::RequestBuilder {
    let url = format!("{}{path}", base_url.trim_end_matches('/'));
    let mut request = client
        .post(url)
        .header("Content-Type", "application/json")
        // Providers hold streaming connections open between chunks.
        .timeout(std::time::Duration::from_secs(60))
        .json(payload);
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}
