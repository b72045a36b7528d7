//! Anthropic provider adapter
//!
//! `POST {base}/messages` with `x-api-key` auth. The system prompt is a
//! dedicated top-level field and message roles must alternate between user
//! and assistant. Streaming uses event-typed SSE: `message_start` carries
//! input tokens, `content_block_delta` carries text, `message_delta`
//! carries output tokens, and `message_stop` terminates.

use crate::error::DispatchError;
use crate::http::RequestOptions;
use crate::profile::{BackendProfile, ProviderKind};
use crate::protocol::{
    approx_tokens, ChatRequest, ChatResponse, MessageRole, StreamEvent, ToolCall, Usage,
};
use crate::providers::sse::{skip_malformed, spawn_normalizer, ChatStream, Frame};
use crate::providers::{require_credentials, ErrorDisposition, Provider};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
// The messages endpoint requires an explicit generation cap
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Stateless adapter for the Anthropic messages API
pub struct AnthropicAdapter {
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Unknown block types are ignored rather than failing the call
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    error_type: Option<String>,
    message: String,
}

/// One event-typed stream payload
#[derive(Debug, Deserialize)]
struct StreamPayload {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn endpoint(profile: &BackendProfile) -> String {
        let base = profile.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        format!("{}/messages", base.trim_end_matches('/'))
    }

    fn to_wire(profile: &BackendProfile, request: &ChatRequest, stream: bool) -> WireRequest {
        // System messages cannot appear in the messages list; they merge
        // into the dedicated system field in document order.
        let mut system_parts: Vec<&str> = Vec::new();
        if let Some(system) = &request.system {
            system_parts.push(system);
        }
        let mut messages = Vec::with_capacity(request.messages.len());
        for message in &request.messages {
            match message.role {
                MessageRole::System => system_parts.push(&message.content),
                MessageRole::User => messages.push(WireMessage {
                    role: "user".to_string(),
                    content: message.content.clone(),
                }),
                MessageRole::Assistant => messages.push(WireMessage {
                    role: "assistant".to_string(),
                    content: message.content.clone(),
                }),
            }
        }

        WireRequest {
            model: profile.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system: if system_parts.is_empty() {
                None
            } else {
                Some(system_parts.join("\n\n"))
            },
            temperature: request.temperature.map(|t| t.clamp(0.0, 1.0)),
            tools: request.tools.as_ref().map(|tools| {
                tools
                    .iter()
                    .map(|tool| WireTool {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        input_schema: tool.parameters.clone(),
                    })
                    .collect()
            }),
            stream: stream.then_some(true),
        }
    }

    fn from_wire(request: &ChatRequest, response: WireResponse) -> ChatResponse {
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        // Blocks are collected in document order; text concatenates, tool
        // calls accumulate, anything unknown is skipped.
        for block in response.content {
            match block {
                ContentBlock::Text { text } => content.push_str(&text),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    parameters: input,
                }),
                ContentBlock::Unknown => {}
            }
        }

        let usage = match response.usage {
            Some(u) => Usage::new(u.input_tokens, u.output_tokens),
            None => Usage::new(
                request
                    .messages
                    .iter()
                    .map(|m| approx_tokens(&m.content))
                    .sum(),
                approx_tokens(&content),
            ),
        };

        ChatResponse {
            content,
            tool_calls,
            usage,
            model: response.model,
            stop_reason: response.stop_reason,
        }
    }

    fn parse_error(status: u16, body: &str) -> DispatchError {
        match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(envelope) => DispatchError::Upstream {
                status,
                code: envelope.error.error_type,
                message: envelope.error.message,
            },
            Err(_) => DispatchError::Upstream {
                status,
                code: None,
                message: if body.is_empty() {
                    format!("HTTP {status}")
                } else {
                    body.to_string()
                },
            },
        }
    }

    async fn send(
        &self,
        profile: &BackendProfile,
        request: &ChatRequest,
        options: &RequestOptions,
        stream: bool,
    ) -> Result<reqwest::Response, DispatchError> {
        require_credentials(profile)?;
        let url = Self::endpoint(profile);
        debug!(profile_id = %profile.id, request_id = %options.request_id, %url, "anthropic request");

        let response = self
            .client
            .post(&url)
            .timeout(options.timeout)
            .header("x-api-key", profile.credentials.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&Self::to_wire(profile, request, stream))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::parse_error(status.as_u16(), &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn complete(
        &self,
        profile: &BackendProfile,
        request: &ChatRequest,
        options: &RequestOptions,
    ) -> Result<ChatResponse, DispatchError> {
        let response = self.send(profile, request, options, false).await?;
        let wire: WireResponse = response.json().await?;
        Ok(Self::from_wire(request, wire))
    }

    async fn stream(
        &self,
        profile: &BackendProfile,
        request: &ChatRequest,
        options: &RequestOptions,
    ) -> Result<ChatStream, DispatchError> {
        let response = self.send(profile, request, options, true).await?;
        let bytes = response.bytes_stream().map_err(DispatchError::from);

        // Input tokens arrive at message_start, output tokens at
        // message_delta; remember the former so each usage event carries
        // both directions.
        let mut input_tokens: u32 = 0;
        Ok(spawn_normalizer(bytes, move |payload| {
            map_event(payload, &mut input_tokens)
        }))
    }

    fn classify(&self, error: &DispatchError) -> ErrorDisposition {
        if let DispatchError::Upstream {
            status,
            code: Some(code),
            ..
        } = error
        {
            return match code.as_str() {
                "rate_limit_error" | "overloaded_error" => ErrorDisposition::Quota,
                _ if *status == 429 => ErrorDisposition::Quota,
                _ => ErrorDisposition::Transient,
            };
        }
        crate::providers::heuristic_classification(error)
    }
}

fn map_event(payload: &str, input_tokens: &mut u32) -> Frame {
    let event: StreamPayload = match serde_json::from_str(payload) {
        Ok(event) => event,
        Err(err) => return skip_malformed(payload, &err),
    };

    match event.event_type.as_str() {
        "message_start" => {
            let usage = event.message.and_then(|m| m.usage).unwrap_or_default();
            *input_tokens = usage.input_tokens;
            Frame::Events(vec![StreamEvent::Usage(Usage::new(
                usage.input_tokens,
                usage.output_tokens,
            ))])
        }
        "content_block_delta" => {
            match event.delta.and_then(|d| d.text) {
                Some(text) if !text.is_empty() => Frame::Events(vec![StreamEvent::Text {
                    content: text,
                }]),
                // Non-text deltas (tool input etc.) are not canonical events
                _ => Frame::Ignored,
            }
        }
        "message_delta" => match event.usage {
            Some(usage) => Frame::Events(vec![StreamEvent::Usage(Usage::new(
                *input_tokens,
                usage.output_tokens,
            ))]),
            None => Frame::Ignored,
        },
        "message_stop" => Frame::Final(Vec::new()),
        "error" => {
            let body = event.error.map(|e| e.message).unwrap_or_default();
            Frame::Fail(DispatchError::Upstream {
                status: 0,
                code: None,
                message: format!("stream error event: {body}"),
            })
        }
        // ping, content_block_start, content_block_stop, future types
        _ => Frame::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use serde_json::json;

    fn profile() -> BackendProfile {
        BackendProfile::new("p1", ProviderKind::Anthropic, "key", "claude-sonnet-4")
    }

    #[test]
    fn system_messages_merge_into_dedicated_field() {
        let request = ChatRequest::new(vec![
            Message::system("rule one"),
            Message::user("hi"),
        ])
        .with_system("rule zero");
        let wire = AnthropicAdapter::to_wire(&profile(), &request, false);
        assert_eq!(wire.system.as_deref(), Some("rule zero\n\nrule one"));
        assert_eq!(wire.messages.len(), 1);
        assert_eq!(wire.messages[0].role, "user");
    }

    #[test]
    fn temperature_is_clamped_to_unit_range() {
        let request = ChatRequest::new(vec![Message::user("hi")]).with_temperature(1.8);
        let wire = AnthropicAdapter::to_wire(&profile(), &request, false);
        assert_eq!(wire.temperature, Some(1.0));
    }

    #[test]
    fn max_tokens_defaults_when_unset() {
        let request = ChatRequest::new(vec![Message::user("hi")]);
        let wire = AnthropicAdapter::to_wire(&profile(), &request, false);
        assert_eq!(wire.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn blocks_collect_in_document_order() {
        let request = ChatRequest::new(vec![Message::user("hi")]);
        let wire: WireResponse = serde_json::from_value(json!({
            "model": "claude-sonnet-4",
            "content": [
                {"type": "text", "text": "Let me check. "},
                {"type": "tool_use", "id": "tu_1", "name": "get_weather", "input": {"city": "Oslo"}},
                {"type": "server_thinking", "whatever": true},
                {"type": "text", "text": "Done."}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 4}
        }))
        .unwrap();
        let response = AnthropicAdapter::from_wire(&request, wire);
        assert_eq!(response.content, "Let me check. Done.");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "get_weather");
        assert_eq!(response.usage, Usage::new(10, 4));
    }

    #[test]
    fn zero_content_blocks_yield_empty_string() {
        let request = ChatRequest::new(vec![Message::user("hi")]);
        let wire: WireResponse = serde_json::from_value(json!({
            "model": "claude-sonnet-4",
            "content": [],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 2, "output_tokens": 0}
        }))
        .unwrap();
        let response = AnthropicAdapter::from_wire(&request, wire);
        assert_eq!(response.content, "");
    }

    #[test]
    fn stream_events_carry_split_usage() {
        let mut input = 0u32;
        let frame = map_event(
            r#"{"type":"message_start","message":{"usage":{"input_tokens":9}}}"#,
            &mut input,
        );
        match frame {
            Frame::Events(events) => {
                assert_eq!(events, vec![StreamEvent::Usage(Usage::new(9, 0))])
            }
            _ => panic!("expected events"),
        }

        let frame = map_event(
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"hey"}}"#,
            &mut input,
        );
        match frame {
            Frame::Events(events) => assert_eq!(
                events,
                vec![StreamEvent::Text {
                    content: "hey".into()
                }]
            ),
            _ => panic!("expected events"),
        }

        // message_delta usage pairs with the remembered input count
        let frame = map_event(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":5}}"#,
            &mut input,
        );
        match frame {
            Frame::Events(events) => {
                assert_eq!(events, vec![StreamEvent::Usage(Usage::new(9, 5))])
            }
            _ => panic!("expected events"),
        }

        assert!(matches!(
            map_event(r#"{"type":"message_stop"}"#, &mut input),
            Frame::Final(_)
        ));
        assert!(matches!(
            map_event(r#"{"type":"ping"}"#, &mut input),
            Frame::Ignored
        ));
    }

    #[test]
    fn rate_limit_error_type_classifies_as_quota() {
        let body = json!({
            "error": {"type": "rate_limit_error", "message": "Number of requests has exceeded your rate limit"}
        })
        .to_string();
        let err = AnthropicAdapter::parse_error(429, &body);
        let adapter = AnthropicAdapter::new(reqwest::Client::new());
        assert_eq!(adapter.classify(&err), ErrorDisposition::Quota);
    }
}
