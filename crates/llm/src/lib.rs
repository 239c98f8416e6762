//! Provider contracts for dialogue intelligence
//!
//! The gateway orchestrates models, it does not run them: concrete
//! ASR/LLM/TTS providers live behind these traits. Streaming responses are
//! delivered over a channel so the dialogue service can check for client
//! aborts between chunks and drop the receiver to cancel.

pub mod intent;
pub mod memory;
pub mod model;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use intent::IntentModel;
pub use memory::MemoryProvider;
pub use model::{LanguageModel, LlmChunk, ToolCallRequest, ToolDefinition};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("generation failed: {0}")]
    Generation(String),

    #[error("provider request failed: {0}")]
    Provider(String),

    #[error("provider timed out")]
    Timeout,

    #[error("response was malformed: {0}")]
    InvalidResponse(String),
}
