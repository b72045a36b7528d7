//! Canonical request, response, and stream-event shapes
//!
//! Every provider adapter translates between its vendor's wire format and
//! the types in this module. Nothing here is vendor-specific.

mod types;

pub use types::{
    approx_tokens, ChatRequest, ChatResponse, Message, MessageRole, StreamEvent, ToolCall,
    ToolDefinition, Usage,
};
