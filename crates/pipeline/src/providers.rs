//! Speech provider contracts
//!
//! Concrete recognizers and synthesizers are external collaborators; the
//! pipeline only relies on these traits. Local models are wrapped by the
//! shared pool, remote ones run per session.

use async_trait::async_trait;
use std::path::PathBuf;

use voice_gateway_core::AudioFormat;

use crate::PipelineError;

#[async_trait]
pub trait AsrEngine: Send + Sync {
    /// Recognize one complete utterance.
    ///
    /// `frames` are Opus packets or raw PCM blocks according to `format`.
    /// Returns the transcript and, for engines that persist the utterance,
    /// the audio file path.
    async fn speech_to_text(
        &self,
        frames: Vec<Vec<u8>>,
        session_id: &str,
        format: AudioFormat,
    ) -> Result<(String, Option<PathBuf>), PipelineError>;
}

#[async_trait]
pub trait TtsEngine: Send + Sync {
    /// Synthesize one sentence into a sequence of wire-ready audio frames,
    /// one frame per 60 ms of speech.
    async fn synthesize(&self, text: &str) -> Result<Vec<Vec<u8>>, PipelineError>;
}

#[async_trait]
pub trait VoiceprintProvider: Send + Sync {
    /// Identify the speaker from a WAV rendering of the utterance.
    async fn identify_speaker(
        &self,
        wav: Vec<u8>,
        session_id: &str,
    ) -> Result<Option<String>, PipelineError>;
}
