//! Intent classifier contract
//!
//! A cheap model consulted before the dialogue LLM. It answers with a JSON
//! object `{"function_call": {"name": …, "arguments": …}}` or the literal
//! `continue_chat` marker inside one, never free text.

use async_trait::async_trait;

use voice_gateway_core::DialogueMessage;

use crate::LlmError;

/// Name the classifier uses to hand the turn back to the dialogue LLM.
pub const CONTINUE_CHAT: &str = "continue_chat";

/// Pseudo-tool meaning "answer directly, enriched with the current
/// time and date".
pub const RESULT_FOR_CONTEXT: &str = "result_for_context";

#[async_trait]
pub trait IntentModel: Send + Sync {
    /// Classify the user text against the recent dialogue.
    async fn detect_intent(
        &self,
        dialogue: &[DialogueMessage],
        text: &str,
    ) -> Result<String, LlmError>;

    /// Produce a short spoken answer from a tool result or an enriched
    /// context prompt. Non-streaming by design: these answers are one
    /// sentence.
    async fn reply_result(
        &self,
        context_prompt: &str,
        original_text: &str,
    ) -> Result<String, LlmError>;
}
