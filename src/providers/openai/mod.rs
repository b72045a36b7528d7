//! OpenAI provider adapter
//!
//! `POST {base}/chat/completions` with bearer auth. Streaming uses OpenAI
//! chunk framing terminated by the `[DONE]` sentinel, with
//! `stream_options.include_usage` requesting a usage frame before it.

mod types;

use crate::error::DispatchError;
use crate::http::RequestOptions;
use crate::profile::BackendProfile;
use crate::protocol::{approx_tokens, ChatRequest, ChatResponse, StreamEvent, ToolCall, Usage};
use crate::providers::sse::{skip_malformed, spawn_normalizer, ChatStream, Frame};
use crate::providers::{require_credentials, ErrorDisposition, Provider};
use async_trait::async_trait;
use futures::TryStreamExt;
use tracing::debug;
use types::*;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Stateless adapter for OpenAI-compatible backends
pub struct OpenAiAdapter {
    client: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn endpoint(profile: &BackendProfile) -> String {
        let base = profile.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }

    fn to_wire(profile: &BackendProfile, request: &ChatRequest, stream: bool) -> OpenAiRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        // OpenAI keeps the system prompt inline as a leading message
        if let Some(system) = &request.system {
            messages.push(OpenAiMessage {
                role: "system".to_string(),
                content: Some(system.clone()),
                tool_calls: None,
            });
        }
        for message in &request.messages {
            messages.push(OpenAiMessage {
                role: match message.role {
                    crate::protocol::MessageRole::System => "system",
                    crate::protocol::MessageRole::User => "user",
                    crate::protocol::MessageRole::Assistant => "assistant",
                }
                .to_string(),
                content: Some(message.content.clone()),
                tool_calls: None,
            });
        }

        OpenAiRequest {
            model: profile.model.clone(),
            messages,
            temperature: request.temperature.map(|t| t.clamp(0.0, 2.0)),
            max_tokens: request.max_tokens,
            tools: request.tools.as_ref().map(|tools| {
                tools
                    .iter()
                    .map(|tool| OpenAiTool {
                        tool_type: "function".to_string(),
                        function: OpenAiFunction {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            parameters: tool.parameters.clone(),
                        },
                    })
                    .collect()
            }),
            stream: stream.then_some(true),
            stream_options: stream.then_some(OpenAiStreamOptions {
                include_usage: true,
            }),
        }
    }

    fn from_wire(request: &ChatRequest, response: OpenAiResponse) -> ChatResponse {
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut stop_reason = None;

        if let Some(choice) = response.choices.into_iter().next() {
            if let Some(text) = choice.message.content {
                content = text;
            }
            for call in choice.message.tool_calls.unwrap_or_default() {
                tool_calls.push(ToolCall {
                    id: call.id,
                    name: call.function.name,
                    parameters: serde_json::from_str(&call.function.arguments)
                        .unwrap_or(serde_json::Value::String(call.function.arguments)),
                });
            }
            stop_reason = choice.finish_reason;
        }

        let usage = match response.usage {
            Some(u) => Usage::new(u.prompt_tokens, u.completion_tokens),
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
            stop_reason,
        }
    }

    /// Best-effort parse of the vendor error envelope, falling back to the
    /// raw status text
    fn parse_error(status: u16, body: &str) -> DispatchError {
        match serde_json::from_str::<OpenAiErrorEnvelope>(body) {
            Ok(envelope) => DispatchError::Upstream {
                status,
                code: envelope.error.code.or(envelope.error.error_type),
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
        debug!(profile_id = %profile.id, request_id = %options.request_id, %url, "openai request");

        let response = self
            .client
            .post(&url)
            .timeout(options.timeout)
            .bearer_auth(profile.credentials.expose_secret())
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
impl Provider for OpenAiAdapter {
    fn kind(&self) -> crate::profile::ProviderKind {
        crate::profile::ProviderKind::OpenAi
    }

    async fn complete(
        &self,
        profile: &BackendProfile,
        request: &ChatRequest,
        options: &RequestOptions,
    ) -> Result<ChatResponse, DispatchError> {
        let response = self.send(profile, request, options, false).await?;
        let wire: OpenAiResponse = response.json().await?;
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
        Ok(spawn_normalizer(bytes, map_chunk))
    }

    fn classify(&self, error: &DispatchError) -> ErrorDisposition {
        if let DispatchError::Upstream {
            status,
            code: Some(code),
            ..
        } = error
        {
            return match code.as_str() {
                "insufficient_quota" | "rate_limit_exceeded" | "rate_limit_error" => {
                    ErrorDisposition::Quota
                }
                _ if *status == 429 => ErrorDisposition::Quota,
                _ => ErrorDisposition::Transient,
            };
        }
        crate::providers::heuristic_classification(error)
    }
}

/// Map one OpenAI stream payload to canonical events.
///
/// Text deltas become `Text`; the usage frame requested via
/// `stream_options` becomes `Usage`. Termination comes from the `[DONE]`
/// sentinel, which the normalizer handles before this mapper runs.
fn map_chunk(payload: &str) -> Frame {
    let chunk: OpenAiStreamChunk = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(err) => return skip_malformed(payload, &err),
    };

    let mut events = Vec::new();
    for choice in chunk.choices {
        if let Some(text) = choice.delta.content {
            if !text.is_empty() {
                events.push(StreamEvent::Text { content: text });
            }
        }
    }
    if let Some(usage) = chunk.usage {
        events.push(StreamEvent::Usage(Usage::new(
            usage.prompt_tokens,
            usage.completion_tokens,
        )));
    }
    Frame::Events(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProviderKind;
    use crate::protocol::{Message, ToolDefinition};
    use serde_json::json;

    fn profile() -> BackendProfile {
        BackendProfile::new("p0", ProviderKind::OpenAi, "sk-test", "gpt-4o")
    }

    #[test]
    fn system_prompt_becomes_leading_message() {
        let request = ChatRequest::new(vec![Message::user("hi")]).with_system("be brief");
        let wire = OpenAiAdapter::to_wire(&profile(), &request, false);
        assert_eq!(wire.messages[0].role, "system");
        assert_eq!(wire.messages[0].content.as_deref(), Some("be brief"));
        assert_eq!(wire.messages[1].role, "user");
    }

    #[test]
    fn temperature_is_clamped_to_documented_range() {
        let request = ChatRequest::new(vec![Message::user("hi")]).with_temperature(7.5);
        let wire = OpenAiAdapter::to_wire(&profile(), &request, false);
        assert_eq!(wire.temperature, Some(2.0));
    }

    #[test]
    fn tools_translate_to_function_schema() {
        let request = ChatRequest::new(vec![Message::user("hi")]).with_tools(vec![
            ToolDefinition {
                name: "get_weather".into(),
                description: Some("Look up weather".into()),
                parameters: json!({"type": "object"}),
            },
        ]);
        let wire = OpenAiAdapter::to_wire(&profile(), &request, false);
        let tools = wire.tools.unwrap();
        assert_eq!(tools[0].tool_type, "function");
        assert_eq!(tools[0].function.name, "get_weather");
    }

    #[test]
    fn streaming_requests_usage_frames() {
        let request = ChatRequest::new(vec![Message::user("hi")]);
        let wire = OpenAiAdapter::to_wire(&profile(), &request, true);
        assert_eq!(wire.stream, Some(true));
        assert!(wire.stream_options.unwrap().include_usage);
    }

    #[test]
    fn empty_choices_yield_empty_content() {
        let request = ChatRequest::new(vec![Message::user("hi")]);
        let response = OpenAiAdapter::from_wire(
            &request,
            OpenAiResponse {
                model: "gpt-4o".into(),
                choices: vec![],
                usage: None,
            },
        );
        assert_eq!(response.content, "");
        assert!(response.tool_calls.is_empty());
        // No usage reported: the chars/4 approximation kicks in
        assert!(response.usage.input_tokens >= 1);
    }

    #[test]
    fn error_envelope_carries_structured_code() {
        let body = json!({
            "error": {"message": "You exceeded your current quota", "type": "insufficient_quota", "code": "insufficient_quota"}
        })
        .to_string();
        let err = OpenAiAdapter::parse_error(429, &body);
        match &err {
            DispatchError::Upstream { status, code, .. } => {
                assert_eq!(*status, 429);
                assert_eq!(code.as_deref(), Some("insufficient_quota"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let adapter = OpenAiAdapter::new(reqwest::Client::new());
        assert_eq!(adapter.classify(&err), ErrorDisposition::Quota);
    }

    #[test]
    fn garbage_error_body_falls_back_to_raw_text() {
        let err = OpenAiAdapter::parse_error(503, "upstream melted");
        match err {
            DispatchError::Upstream { status, code, message } => {
                assert_eq!(status, 503);
                assert!(code.is_none());
                assert_eq!(message, "upstream melted");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn stream_chunk_maps_text_and_usage() {
        let frame = map_chunk(r#"{"choices":[{"delta":{"content":"hello"},"finish_reason":null}]}"#);
        match frame {
            Frame::Events(events) => assert_eq!(
                events,
                vec![StreamEvent::Text {
                    content: "hello".into()
                }]
            ),
            _ => panic!("expected events"),
        }

        let frame = map_chunk(r#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":1}}"#);
        match frame {
            Frame::Events(events) => {
                assert_eq!(events, vec![StreamEvent::Usage(Usage::new(3, 1))])
            }
            _ => panic!("expected events"),
        }
    }
}
