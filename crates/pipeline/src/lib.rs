//! Per-session media pipeline
//!
//! Voice activity detection, utterance assembly for recognition, the shared
//! local-inference pool, and the TTS orchestrator with its audio-paced
//! downstream sender.

pub mod asr;
pub mod codec;
pub mod pool;
pub mod providers;
pub mod queue;
pub mod tts;
pub mod vad;

pub use asr::AsrAdapter;
pub use pool::{SharedAsrHandle, SharedAsrPool};
pub use providers::{AsrEngine, TtsEngine, VoiceprintProvider};
pub use queue::ClearableQueue;
pub use tts::TtsOrchestrator;
pub use vad::{EnergyScorer, VadOutcome, VadProcessor, VadScorer};

use thiserror::Error;

/// Polite phrase spoken when the shared recognizer pool is saturated.
pub const BUSY_MESSAGE: &str = "服务繁忙，请稍后重试";

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Shared pool queue full. Never a hard error for the user.
    #[error("recognizer busy")]
    Busy,

    #[error("recognizer shutting down")]
    ShuttingDown,

    #[error("audio decode failed: {0}")]
    Decode(String),

    #[error("recognition failed: {0}")]
    Recognition(String),

    #[error("synthesis failed: {0}")]
    Synthesis(String),

    #[error("audio file unreadable: {0}")]
    AudioFile(String),

    #[error("session channel closed")]
    ChannelClosed,
}
