//! Core canonical types for LLM interactions
//!
//! Design notes:
//! - Strong typing through enums; adapters own the lossy vendor mapping.
//! - Serde derives throughout: these types cross a JSON transport boundary
//!   in the host application.
//! - Token counts are approximations whenever a backend omits usage data.

use serde::{Deserialize, Serialize};

/// Role of a message in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instructions that guide the model's behavior
    System,
    /// User input message
    User,
    /// Assistant (model) response
    Assistant,
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Tool definition offered to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's parameters
    pub parameters: serde_json::Value,
}

/// Chat completion request in canonical form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChatRequest {
    /// Ordered conversation messages
    #[serde(default)]
    pub messages: Vec<Message>,

    /// Dedicated system prompt; adapters merge or inline it as their
    /// backend requires
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// Tool definitions for function calling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,

    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature; adapters clamp to their backend's range
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Whether the caller wants a streamed response
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    /// Create a new request from conversation messages
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Set the dedicated system prompt
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set sampling temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the generation cap
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Offer tool definitions to the model
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Request a streamed response
    pub fn with_streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Parsed argument object; left as a raw JSON string value when the
    /// vendor payload was not valid JSON
    pub parameters: serde_json::Value,
}

/// Token usage for one completed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Total tokens across both directions
    pub fn total(&self) -> u64 {
        u64::from(self.input_tokens) + u64::from(self.output_tokens)
    }
}

/// Rough token count for text with no backend-reported usage.
///
/// This is the documented chars/4 approximation, nothing more; exact
/// tokenizers are out of scope.
pub fn approx_tokens(text: &str) -> u32 {
    (text.chars().count() as u32 / 4).max(1)
}

/// Chat completion response in canonical form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Concatenated text content, empty when the model produced none
    pub content: String,

    /// Tool invocations in document order
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,

    pub usage: Usage,

    /// Model that produced the response, as reported by the backend
    pub model: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

/// One event in a canonical response stream.
///
/// A well-formed sequence contains zero or more `Text` and `Usage` events
/// and is terminated by exactly one `Done`. Callers must not assume exactly
/// one `Usage` event: backends report usage at stream start, mid-stream, or
/// at the end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental text delta
    Text { content: String },
    /// Token usage snapshot
    Usage(Usage),
    /// Terminal marker; nothing follows
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let msg = Message::system("You are a helpful assistant");
        assert_eq!(msg.role, MessageRole::System);
        assert_eq!(msg.content, "You are a helpful assistant");

        let msg = Message::user("hi");
        assert_eq!(msg.role, MessageRole::User);

        let msg = Message::assistant("hello");
        assert_eq!(msg.role, MessageRole::Assistant);
    }

    #[test]
    fn request_builder() {
        let request = ChatRequest::new(vec![Message::user("What is 2+2?")])
            .with_system("Be brief")
            .with_temperature(0.7)
            .with_max_tokens(100)
            .with_streaming();

        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.system.as_deref(), Some("Be brief"));
        assert_eq!(request.temperature, Some(0.7));
        assert_eq!(request.max_tokens, Some(100));
        assert!(request.stream);
    }

    #[test]
    fn approx_tokens_floors_at_one() {
        assert_eq!(approx_tokens(""), 1);
        assert_eq!(approx_tokens("hi"), 1);
        assert_eq!(approx_tokens("twelve chars"), 3);
    }

    #[test]
    fn stream_event_round_trips() {
        let event = StreamEvent::Usage(Usage::new(3, 1));
        let json = serde_json::to_string(&event).unwrap();
        let parsed: StreamEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
