//! OpenAI and Mistral adapters.
//!
//! Both families speak the `chat/completions` dialect and frame SSE as
//! `data:` lines terminated by a `[DONE]` sentinel, with usage sometimes
//! arriving in a trailing usage-only chunk.

use crate::{
    send_stream_request, AdapterError, ChatParams, ChunkStream, NormalizedResponse, StreamChunk,
    TokenUsage,
};
use async_stream::try_stream;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// OpenAI chat-completions adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenAiAdapter;

/// Mistral adapter; wire-compatible with the OpenAI dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MistralAdapter;

fn prepare_chat_completions(params: ChatParams<'_>) -> Value {
    let mut payload = Map::new();
    payload.insert("model".into(), json!(params.model));
    payload.insert("messages".into(), json!(params.messages));
    if let Some(max_tokens) = params.max_tokens {
        payload.insert("max_tokens".into(), json!(max_tokens));
    }
    if let Some(temperature) = params.temperature {
        payload.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = params.top_p {
        payload.insert("top_p".into(), json!(top_p));
    }
    if let Some(stop) = params.stop {
        payload.insert("stop".into(), json!(stop));
    }
    if params.stream {
        payload.insert("stream".into(), json!(true));
    }
    Value::Object(payload)
}

fn parse_chat_completions(response: &Value) -> Result<NormalizedResponse, AdapterError> {
    let choice = response
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| AdapterError::Decode("missing 'choices' field".into()))?;
    let message = choice.get("message").cloned().unwrap_or_default();
    Ok(NormalizedResponse {
        content: message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        role: message
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("assistant")
            .to_string(),
        finish_reason: choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .unwrap_or("stop")
            .to_string(),
        usage: parse_usage(response.get("usage")),
    })
}

fn parse_usage(usage: Option<&Value>) -> Option<TokenUsage> {
    let usage = usage?.as_object()?;
    Some(TokenUsage {
        prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
        completion_tokens: usage
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    })
}

/// Streams a `data:`-framed chat completion, yielding normalised chunks.
fn stream_chat_completions(
    client: &reqwest::Client,
    base_url: &str,
    path: &str,
    payload: Value,
    headers: &HashMap<String, String>,
) -> ChunkStream {
    let request = send_stream_request(client, base_url, path, &payload, headers);
    Box::pin(try_stream! {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Upstream { status: status.as_u16(), body })?;
        }

        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| AdapterError::Decode(e.to_string()))?;
            if event.data.trim() == "[DONE]" {
                // A usage-only chunk may still follow; keep reading.
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
                continue;
            };

            if let Some(usage) = parse_usage(value.get("usage")) {
                yield StreamChunk::Usage(usage);
            }
            let Some(choice) = value
                .get("choices")
                .and_then(|c| c.as_array())
                .and_then(|c| c.first())
            else {
                continue;
            };
            if let Some(delta) = choice
                .get("delta")
                .and_then(|d| d.get("content"))
                .and_then(Value::as_str)
            {
                if !delta.is_empty() {
                    yield StreamChunk::Delta(delta.to_string());
                }
            }
            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                yield StreamChunk::Finish(reason.to_string());
            }
        }
    })
}

impl OpenAiAdapter {
    pub fn prepare_request(&self, params: ChatParams<'_>) -> Value {
        prepare_chat_completions(params)
    }

    pub fn parse_response(&self, response: &Value) -> Result<NormalizedResponse, AdapterError> {
        parse_chat_completions(response)
    }

    pub fn stream_chat(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        path: &str,
        payload: Value,
        headers: &HashMap<String, String>,
    ) -> ChunkStream {
        stream_chat_completions(client, base_url, path, payload, headers)
    }
}

impl MistralAdapter {
    pub fn prepare_request(&self, params: ChatParams<'_>) -> Value {
        prepare_chat_completions(params)
    }

    pub fn parse_response(&self, response: &Value) -> Result<NormalizedResponse, AdapterError> {
        parse_chat_completions(response)
    }

    pub fn stream_chat(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        path: &str,
        payload: Value,
        headers: &HashMap<String, String>,
    ) -> ChunkStream {
        stream_chat_completions(client, base_url, path, payload, headers)
    }
}
