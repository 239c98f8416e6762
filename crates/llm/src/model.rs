//! Dialogue language model contract

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use voice_gateway_core::DialogueMessage;

use crate::LlmError;

/// A tool the model may call, in the provider-neutral schema shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

/// A structured tool invocation emitted by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Raw arguments JSON as the provider produced it.
    pub arguments: String,
}

/// One streaming chunk: token text, tool calls, or both.
#[derive(Debug, Clone, Default)]
pub struct LlmChunk {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl LlmChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_call(call: ToolCallRequest) -> Self {
        Self {
            text: None,
            tool_calls: vec![call],
        }
    }
}

/// Streaming chat completion.
///
/// Chunks arrive on the returned receiver; the stream ends when the sender
/// side is dropped. Consumers cancel by dropping the receiver, and must
/// check their abort flag between chunks rather than awaiting blindly.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn chat_stream(
        &self,
        session_id: &str,
        messages: Vec<DialogueMessage>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<mpsc::Receiver<LlmChunk>, LlmError>;
}
