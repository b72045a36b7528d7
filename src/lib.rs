//! Quota-aware multiplexing dispatcher for LLM chat backends
//!
//! This crate routes canonical chat requests to one of several configured
//! upstream backends, normalizes each backend's streaming wire protocol
//! into one canonical event sequence, and fails over to the next profile
//! when the active one exhausts its quota or errors.
//!
//! The library owns no transport: an HTTP/WebSocket server, settings
//! persistence, and UI live in the host application. Quota counters are
//! in-memory only and do not survive restarts.
//!
//! ```no_run
//! use llmux::{BackendProfile, ChatRequest, FallbackOrchestrator, Message, ProviderKind};
//!
//! # async fn run() -> Result<(), llmux::DispatchError> {
//! let orchestrator = FallbackOrchestrator::new(vec![
//!     BackendProfile::new("primary", ProviderKind::Anthropic, "sk-ant-...", "claude-sonnet-4"),
//!     BackendProfile::new("fallback", ProviderKind::OpenAi, "sk-...", "gpt-4o-mini"),
//! ])?;
//!
//! let request = ChatRequest::new(vec![Message::user("hi")]).with_max_tokens(64);
//! let response = orchestrator.complete(&request).await?;
//! println!("{}", response.content);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod http;
pub mod orchestrator;
pub mod profile;
pub mod protocol;
pub mod providers;
pub mod quota;

pub use error::{DispatchError, DispatchResult};
pub use http::RequestOptions;
pub use orchestrator::FallbackOrchestrator;
pub use profile::{BackendProfile, ProviderKind, QuotaLimit, SecretString};
pub use protocol::{
    ChatRequest, ChatResponse, Message, MessageRole, StreamEvent, ToolCall, ToolDefinition, Usage,
};
pub use providers::{ChatStream, ErrorDisposition, Provider, ProviderSet};
pub use quota::{QuotaTracker, QuotaUsage};
