//! Scripted providers for tests
//!
//! The pipeline and dialogue tests drive real control flow against these
//! doubles instead of a live model.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::mpsc;

use voice_gateway_core::DialogueMessage;

use crate::{IntentModel, LanguageModel, LlmChunk, LlmError, ToolDefinition};

/// Replays one scripted chunk sequence per `chat_stream` call.
#[derive(Default)]
pub struct ScriptedLlm {
    scripts: Mutex<VecDeque<Vec<LlmChunk>>>,
    pub calls: Mutex<Vec<(Vec<DialogueMessage>, bool)>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_script(&self, chunks: Vec<LlmChunk>) {
        self.scripts.lock().push_back(chunks);
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn chat_stream(
        &self,
        _session_id: &str,
        messages: Vec<DialogueMessage>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<mpsc::Receiver<LlmChunk>, LlmError> {
        self.calls.lock().push((messages, tools.is_some()));
        let chunks = self
            .scripts
            .lock()
            .pop_front()
            .ok_or_else(|| LlmError::Generation("no script queued".to_string()))?;

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// Returns a fixed classification for every call.
pub struct FixedIntent {
    pub classification: String,
    pub reply: String,
}

impl FixedIntent {
    pub fn continue_chat() -> Self {
        Self {
            classification: r#"{"function_call": {"name": "continue_chat"}}"#.to_string(),
            reply: String::new(),
        }
    }

    pub fn function_call(name: &str, arguments: serde_json::Value) -> Self {
        Self {
            classification: serde_json::json!({
                "function_call": { "name": name, "arguments": arguments }
            })
            .to_string(),
            reply: String::new(),
        }
    }
}

#[async_trait]
impl IntentModel for FixedIntent {
    async fn detect_intent(
        &self,
        _dialogue: &[DialogueMessage],
        _text: &str,
    ) -> Result<String, LlmError> {
        Ok(self.classification.clone())
    }

    async fn reply_result(
        &self,
        _context_prompt: &str,
        original_text: &str,
    ) -> Result<String, LlmError> {
        if self.reply.is_empty() {
            Ok(original_text.to_string())
        } else {
            Ok(self.reply.clone())
        }
    }
}
