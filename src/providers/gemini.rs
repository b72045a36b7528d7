//! Gemini provider adapter
//!
//! `POST {base}/models/{model}:generateContent` with `x-goog-api-key` auth;
//! streaming switches to `:streamGenerateContent?alt=sse`. Conversation
//! turns use `user`/`model` roles, the system prompt rides in
//! `systemInstruction`, and usage arrives as `usageMetadata` on response
//! chunks. The stream has no sentinel: the final chunk carries a
//! `finishReason` and then the connection closes.

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
use uuid::Uuid;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Stateless adapter for the Gemini generateContent API
pub struct GeminiAdapter {
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTools>>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "functionCall", skip_serializing_if = "Option::is_none", default)]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTools {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Content,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    /// Symbolic status such as RESOURCE_EXHAUSTED
    status: Option<String>,
}

impl GeminiAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn endpoint(profile: &BackendProfile, stream: bool) -> String {
        let base = profile.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let base = base.trim_end_matches('/');
        if stream {
            format!("{base}/models/{}:streamGenerateContent?alt=sse", profile.model)
        } else {
            format!("{base}/models/{}:generateContent", profile.model)
        }
    }

    fn to_wire(request: &ChatRequest) -> WireRequest {
        let mut system_parts: Vec<Part> = Vec::new();
        if let Some(system) = &request.system {
            system_parts.push(Part {
                text: Some(system.clone()),
                function_call: None,
            });
        }

        let mut contents = Vec::with_capacity(request.messages.len());
        for message in &request.messages {
            let role = match message.role {
                // Gemini has no system role inside contents
                MessageRole::System => {
                    system_parts.push(Part {
                        text: Some(message.content.clone()),
                        function_call: None,
                    });
                    continue;
                }
                MessageRole::User => "user",
                MessageRole::Assistant => "model",
            };
            contents.push(Content {
                role: Some(role.to_string()),
                parts: vec![Part {
                    text: Some(message.content.clone()),
                    function_call: None,
                }],
            });
        }

        WireRequest {
            contents,
            system_instruction: if system_parts.is_empty() {
                None
            } else {
                Some(Content {
                    role: None,
                    parts: system_parts,
                })
            },
            generation_config: if request.temperature.is_some() || request.max_tokens.is_some() {
                Some(GenerationConfig {
                    temperature: request.temperature.map(|t| t.clamp(0.0, 2.0)),
                    max_output_tokens: request.max_tokens,
                })
            } else {
                None
            },
            tools: request.tools.as_ref().map(|tools| {
                vec![WireTools {
                    function_declarations: tools
                        .iter()
                        .map(|tool| FunctionDeclaration {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            parameters: tool.parameters.clone(),
                        })
                        .collect(),
                }]
            }),
        }
    }

    fn from_wire(profile: &BackendProfile, request: &ChatRequest, response: WireResponse) -> ChatResponse {
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut stop_reason = None;

        if let Some(candidate) = response.candidates.into_iter().next() {
            for part in candidate.content.parts {
                if let Some(text) = part.text {
                    content.push_str(&text);
                }
                if let Some(call) = part.function_call {
                    // Gemini does not assign call ids; synthesize one so the
                    // canonical shape stays uniform
                    tool_calls.push(ToolCall {
                        id: Uuid::new_v4().to_string(),
                        name: call.name,
                        parameters: call.args,
                    });
                }
            }
            stop_reason = candidate.finish_reason;
        }

        let usage = match response.usage_metadata {
            Some(u) => Usage::new(u.prompt_token_count, u.candidates_token_count),
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
            model: response.model_version.unwrap_or_else(|| profile.model.clone()),
            stop_reason,
        }
    }

    fn parse_error(status: u16, body: &str) -> DispatchError {
        match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(envelope) => DispatchError::Upstream {
                status,
                code: envelope.error.status,
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
        let url = Self::endpoint(profile, stream);
        debug!(profile_id = %profile.id, request_id = %options.request_id, %url, "gemini request");

        let response = self
            .client
            .post(&url)
            .timeout(options.timeout)
            .header("x-goog-api-key", profile.credentials.expose_secret())
            .json(&Self::to_wire(request))
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
impl Provider for GeminiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn complete(
        &self,
        profile: &BackendProfile,
        request: &ChatRequest,
        options: &RequestOptions,
    ) -> Result<ChatResponse, DispatchError> {
        let response = self.send(profile, request, options, false).await?;
        let wire: WireResponse = response.json().await?;
        Ok(Self::from_wire(profile, request, wire))
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
                "RESOURCE_EXHAUSTED" => ErrorDisposition::Quota,
                _ if *status == 429 => ErrorDisposition::Quota,
                _ => ErrorDisposition::Transient,
            };
        }
        crate::providers::heuristic_classification(error)
    }
}

/// Map one streamed chunk; a chunk with a finish reason is the last one
fn map_chunk(payload: &str) -> Frame {
    let chunk: WireResponse = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(err) => return skip_malformed(payload, &err),
    };

    let mut events = Vec::new();
    let mut finished = false;
    for candidate in chunk.candidates {
        for part in candidate.content.parts {
            if let Some(text) = part.text {
                if !text.is_empty() {
                    events.push(StreamEvent::Text { content: text });
                }
            }
        }
        if candidate.finish_reason.is_some() {
            finished = true;
        }
    }
    if let Some(usage) = chunk.usage_metadata {
        events.push(StreamEvent::Usage(Usage::new(
            usage.prompt_token_count,
            usage.candidates_token_count,
        )));
    }

    if finished {
        Frame::Final(events)
    } else {
        Frame::Events(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use serde_json::json;

    fn profile() -> BackendProfile {
        BackendProfile::new("p2", ProviderKind::Gemini, "g-key", "gemini-2.0-flash")
    }

    #[test]
    fn endpoint_switches_for_streaming() {
        assert!(GeminiAdapter::endpoint(&profile(), false).ends_with(":generateContent"));
        assert!(GeminiAdapter::endpoint(&profile(), true)
            .ends_with(":streamGenerateContent?alt=sse"));
    }

    #[test]
    fn roles_map_to_user_and_model() {
        let request = ChatRequest::new(vec![
            Message::user("hi"),
            Message::assistant("hello"),
        ])
        .with_system("be terse");
        let wire = GeminiAdapter::to_wire(&request);
        assert_eq!(wire.contents[0].role.as_deref(), Some("user"));
        assert_eq!(wire.contents[1].role.as_deref(), Some("model"));
        let instruction = wire.system_instruction.unwrap();
        assert_eq!(instruction.parts[0].text.as_deref(), Some("be terse"));
    }

    #[test]
    fn inline_system_messages_join_the_instruction() {
        let request = ChatRequest::new(vec![Message::system("rule"), Message::user("hi")]);
        let wire = GeminiAdapter::to_wire(&request);
        assert_eq!(wire.contents.len(), 1);
        assert_eq!(
            wire.system_instruction.unwrap().parts[0].text.as_deref(),
            Some("rule")
        );
    }

    #[test]
    fn function_calls_get_synthesized_ids() {
        let request = ChatRequest::new(vec![Message::user("weather?")]);
        let wire: WireResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"name": "get_weather", "args": {"city": "Oslo"}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 2}
        }))
        .unwrap();
        let response = GeminiAdapter::from_wire(&profile(), &request, wire);
        assert_eq!(response.tool_calls.len(), 1);
        assert!(!response.tool_calls[0].id.is_empty());
        assert_eq!(response.usage, Usage::new(5, 2));
        assert_eq!(response.model, "gemini-2.0-flash");
    }

    #[test]
    fn finish_reason_terminates_the_stream() {
        let frame = map_chunk(
            r#"{"candidates":[{"content":{"parts":[{"text":"done"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":1}}"#,
        );
        match frame {
            Frame::Final(events) => {
                assert_eq!(
                    events,
                    vec![
                        StreamEvent::Text {
                            content: "done".into()
                        },
                        StreamEvent::Usage(Usage::new(3, 1)),
                    ]
                );
            }
            _ => panic!("expected terminal frame"),
        }

        let frame = map_chunk(r#"{"candidates":[{"content":{"parts":[{"text":"more"}]}}]}"#);
        assert!(matches!(frame, Frame::Events(_)));
    }

    #[test]
    fn resource_exhausted_classifies_as_quota() {
        let body = json!({
            "error": {"code": 429, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED"}
        })
        .to_string();
        let err = GeminiAdapter::parse_error(429, &body);
        let adapter = GeminiAdapter::new(reqwest::Client::new());
        assert_eq!(adapter.classify(&err), ErrorDisposition::Quota);
    }
}
