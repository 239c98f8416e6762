//! Placeholder providers
//!
//! Stand-ins used when no concrete speech or model provider is wired in.
//! They keep an unconfigured gateway honest: recognition yields nothing,
//! synthesis fails visibly in the logs, and the dialogue model answers with
//! a configuration hint instead of pretending to think.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use voice_gateway_core::{AudioFormat, DialogueMessage};
use voice_gateway_llm::{LanguageModel, LlmChunk, LlmError, ToolDefinition};
use voice_gateway_pipeline::{AsrEngine, PipelineError, TtsEngine};

pub struct DefaultAsr;

#[async_trait]
impl AsrEngine for DefaultAsr {
    async fn speech_to_text(
        &self,
        _frames: Vec<Vec<u8>>,
        session_id: &str,
        _format: AudioFormat,
    ) -> Result<(String, Option<PathBuf>), PipelineError> {
        tracing::warn!(session_id, "no ASR provider configured, utterance discarded");
        Ok((String::new(), None))
    }
}

pub struct DefaultTts;

#[async_trait]
impl TtsEngine for DefaultTts {
    async fn synthesize(&self, _text: &str) -> Result<Vec<Vec<u8>>, PipelineError> {
        Err(PipelineError::Synthesis(
            "no TTS provider configured".to_string(),
        ))
    }
}

pub struct DefaultLlm;

#[async_trait]
impl LanguageModel for DefaultLlm {
    async fn chat_stream(
        &self,
        session_id: &str,
        _messages: Vec<DialogueMessage>,
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<mpsc::Receiver<LlmChunk>, LlmError> {
        tracing::warn!(session_id, "no LLM provider configured");
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let _ = tx
                .send(LlmChunk::text("请先在配置文件中设置大语言模型服务。"))
                .await;
        });
        Ok(rx)
    }
}

/// Placeholder set for a bare start; deployments inject real providers.
pub fn placeholder_asr() -> Arc<dyn AsrEngine> {
    Arc::new(DefaultAsr)
}

pub fn placeholder_tts() -> Arc<dyn TtsEngine> {
    Arc::new(DefaultTts)
}

pub fn placeholder_llm() -> Arc<dyn LanguageModel> {
    Arc::new(DefaultLlm)
}
