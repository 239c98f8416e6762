//! Long-term memory contract
//!
//! Storage is an external collaborator; the gateway only queries a summary
//! to enrich LLM prompts and hands the dialogue over on session teardown.

use async_trait::async_trait;

use voice_gateway_core::DialogueMessage;

use crate::LlmError;

#[async_trait]
pub trait MemoryProvider: Send + Sync {
    /// Memory snippet relevant to `text`, if any.
    async fn query_memory(&self, text: &str) -> Result<Option<String>, LlmError>;

    /// Persist the finished session's dialogue.
    async fn save_memory(&self, messages: &[DialogueMessage]) -> Result<(), LlmError>;
}
