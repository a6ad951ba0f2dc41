//! Anthropic adapter.
//!
//! The messages API frames SSE with named events (`content_block_delta`,
//! `message_delta`, `message_stop`, …) rather than a `[DONE]` sentinel,
//! and reports usage as `input_tokens`/`output_tokens` split between the
//! start and end of the stream.

use crate::{
    send_stream_request, AdapterError, ChatParams, ChunkStream, NormalizedResponse, StreamChunk,
    TokenUsage,
};
use async_stream::try_stream;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Completion budget applied when the caller supplies no `max_tokens`;
/// the messages API requires the field.
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Anthropic messages adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnthropicAdapter;

impl AnthropicAdapter {
    pub fn prepare_request(&self, params: ChatParams<'_>) -> Value {
        let mut payload = Map::new();
        payload.insert("model".into(), json!(params.model));
        payload.insert("messages".into(), json!(params.messages));
        payload.insert(
            "max_tokens".into(),
            json!(params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        );
        if let Some(temperature) = params.temperature {
            payload.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = params.top_p {
            payload.insert("top_p".into(), json!(top_p));
        }
        if let Some(stop) = params.stop {
            payload.insert("stop_sequences".into(), json!(stop));
        }
        if params.stream {
            payload.insert("stream".into(), json!(true));
        }
        Value::Object(payload)
    }

    pub fn parse_response(&self, response: &Value) -> Result<NormalizedResponse, AdapterError> {
        let blocks = response
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| AdapterError::Decode("missing 'content' field".into()))?;
        let mut content = String::new();
        for block in blocks {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                content.push_str(block.get("text").and_then(Value::as_str).unwrap_or_default());
            }
        }
        Ok(NormalizedResponse {
            content,
            role: "assistant".to_string(),
            finish_reason: response
                .get("stop_reason")
                .and_then(Value::as_str)
                .unwrap_or("stop")
                .to_string(),
            usage: parse_usage(response.get("usage")),
        })
    }

    pub fn stream_chat(
        &self,
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
                let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
                    continue;
                };
                match event.event.as_str() {
                    "message_start" => {
                        // Prompt tokens arrive with the message envelope.
                        if let Some(usage) =
                            parse_usage(value.get("message").and_then(|m| m.get("usage")))
                        {
                            yield StreamChunk::Usage(usage);
                        }
                    }
                    "content_block_delta" => {
                        if let Some(text) = value
                            .get("delta")
                            .and_then(|d| d.get("text"))
                            .and_then(Value::as_str)
                        {
                            if !text.is_empty() {
                                yield StreamChunk::Delta(text.to_string());
                            }
                        }
                    }
                    "message_delta" => {
                        if let Some(usage) = parse_usage(value.get("usage")) {
                            yield StreamChunk::Usage(usage);
                        }
                        if let Some(reason) = value
                            .get("delta")
                            .and_then(|d| d.get("stop_reason"))
                            .and_then(Value::as_str)
                        {
                            yield StreamChunk::Finish(reason.to_string());
                        }
                    }
                    "message_stop" => {
                        yield StreamChunk::Finish(
                            value
                                .get("stop_reason")
                                .and_then(Value::as_str)
                                .unwrap_or("stop")
                                .to_string(),
                        );
                    }
                    _ => {}
                }
            }
        })
    }
}

fn parse_usage(usage: Option<&Value>) -> Option<TokenUsage> {
    let usage = usage?.as_object()?;
    if usage.is_empty() {
        return None;
    }
    Some(TokenUsage {
        prompt_tokens: usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        completion_tokens: usage
            .get("output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChatMessage;
    use futures::TryStreamExt;
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn max_tokens_defaults_when_absent() {
        let msgs = vec![ChatMessage {
            role: "user".into(),
            content: "Hello".into(),
        }];
        let payload = AnthropicAdapter.prepare_request(ChatParams {
            messages: &msgs,
            model: "claude-3-haiku-20240307",
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            stream: false,
        });
        assert_eq!(payload["max_tokens"], 1024);
    }

    #[test]
    fn stop_maps_to_stop_sequences() {
        let msgs = vec![ChatMessage {
            role: "user".into(),
            content: "Hello".into(),
        }];
        let stop = vec!["END".to_string()];
        let payload = AnthropicAdapter.prepare_request(ChatParams {
            messages: &msgs,
            model: "claude-3-haiku-20240307",
            max_tokens: Some(64),
            temperature: None,
            top_p: None,
            stop: Some(&stop),
            stream: false,
        });
        assert_eq!(payload["stop_sequences"][0], "END");
        assert!(payload.get("stop").is_none());
    }

    #[test]
    fn parses_content_blocks_and_usage() {
        let response = serde_json::json!({
            "content": [
                {"type": "text", "text": "Hello "},
                {"type": "tool_use", "id": "x"},
                {"type": "text", "text": "world"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 4}
        });
        let parsed = AnthropicAdapter.parse_response(&response).unwrap();
        assert_eq!(parsed.content, "Hello world");
        assert_eq!(parsed.finish_reason, "end_turn");
        assert_eq!(
            parsed.usage,
            Some(TokenUsage {
                prompt_tokens: 12,
                completion_tokens: 4
            })
        );
    }

    #[tokio::test]
    async fn streams_named_events() {
        let server = MockServer::start().await;
        let body = concat!(
            "event: message_start\n",
            "data: {\"message\":{\"usage\":{\"input_tokens\":25}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"delta\":{\"type\":\"text_delta\",\"text\":\"!\"}}\n\n",
            "event: message_delta\n",
            "data: {\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
            "event: message_stop\n",
            "data: {}\n\n",
        );
        Mock::given(method("POST"))
            .and(url_path("/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let chunks: Vec<StreamChunk> = AnthropicAdapter
            .stream_chat(
                &client,
                &server.uri(),
                "/messages",
                serde_json::json!({"model": "claude-3-haiku-20240307", "stream": true}),
                &HashMap::new(),
            )
            .try_collect()
            .await
            .unwrap();

        assert_eq!(
            chunks,
            vec![
                StreamChunk::Usage(TokenUsage {
                    prompt_tokens: 25,
                    completion_tokens: 0
                }),
                StreamChunk::Delta("Hi".into()),
                StreamChunk::Delta("!".into()),
                StreamChunk::Usage(TokenUsage {
                    prompt_tokens: 0,
                    completion_tokens: 2
                }),
                StreamChunk::Finish("end_turn".into()),
                StreamChunk::Finish("stop".into()),
            ]
        );
    }
}
