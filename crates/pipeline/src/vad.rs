//! Voice activity detection
//!
//! Frames are decoded to 16 kHz mono PCM and windowed into fixed 512-sample
//! chunks. Each chunk is scored and classified with dual thresholds: at or
//! above the high threshold it is voice, at or below the low threshold it is
//! silence, in between the previous classification carries over. A sliding
//! window of the last five chunks with three or more voice chunks flips the
//! session's `have_voice`; a silence run longer than the configured duration
//! after voice sets `voice_stopped`.
//!
//! `manual` listen mode bypasses classification entirely: every frame is
//! accepted and utterance boundaries come from `listen` control frames.

use std::collections::VecDeque;

use voice_gateway_config::VadConfig;
use voice_gateway_core::{now_ms, AudioFormat, ListenMode, SessionContext};

use crate::codec::{pcm_bytes_to_samples, OpusStreamDecoder};
use crate::PipelineError;

const CHUNK_SAMPLES: usize = 512;
const WINDOW_CHUNKS: usize = 5;

/// Chunk scorer. Stateful per session; implementations may keep model
/// context between chunks.
pub trait VadScorer: Send {
    /// Voice likelihood in `[0, 1]`.
    fn score(&mut self, chunk: &[i16]) -> f32;
}

/// Energy-based scorer used when no model-backed scorer is configured.
///
/// Maps chunk RMS level in dBFS onto `[0, 1]` between a noise floor and a
/// speech ceiling.
pub struct EnergyScorer {
    floor_db: f32,
    ceiling_db: f32,
}

impl Default for EnergyScorer {
    fn default() -> Self {
        Self {
            floor_db: -55.0,
            ceiling_db: -15.0,
        }
    }
}

impl VadScorer for EnergyScorer {
    fn score(&mut self, chunk: &[i16]) -> f32 {
        if chunk.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = chunk
            .iter()
            .map(|&s| {
                let f = s as f64 / i16::MAX as f64;
                f * f
            })
            .sum();
        let rms = (sum_sq / chunk.len() as f64).sqrt().max(1e-9);
        let db = 20.0 * rms.log10() as f32;
        ((db - self.floor_db) / (self.ceiling_db - self.floor_db)).clamp(0.0, 1.0)
    }
}

/// What one inbound frame did to the session's voice state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VadOutcome {
    /// Window verdict for this frame's chunks.
    pub have_voice: bool,
    /// `have_voice` flipped false → true on this frame.
    pub speech_started: bool,
    /// The silence threshold elapsed and `voice_stopped` was set.
    pub speech_stopped: bool,
}

pub struct VadProcessor {
    config: VadConfig,
    scorer: Box<dyn VadScorer>,
    decoder: Option<OpusStreamDecoder>,
    pcm_buffer: Vec<i16>,
    window: VecDeque<bool>,
    last_is_voice: bool,
    last_voice_ms: u64,
}

impl VadProcessor {
    pub fn new(config: VadConfig, scorer: Box<dyn VadScorer>) -> Self {
        Self {
            config,
            scorer,
            decoder: None,
            pcm_buffer: Vec::new(),
            window: VecDeque::with_capacity(WINDOW_CHUNKS),
            last_is_voice: false,
            last_voice_ms: 0,
        }
    }

    pub fn with_energy_scorer(config: VadConfig) -> Self {
        Self::new(config, Box::new(EnergyScorer::default()))
    }

    /// Classify one inbound audio frame and update the session flags.
    pub fn process(
        &mut self,
        ctx: &SessionContext,
        frame: &[u8],
    ) -> Result<VadOutcome, PipelineError> {
        if ctx.listen_mode() == ListenMode::Manual {
            // Manual mode: accept everything, boundaries come from control
            // frames.
            return Ok(VadOutcome {
                have_voice: true,
                speech_started: false,
                speech_stopped: false,
            });
        }

        let samples = match ctx.audio_format() {
            AudioFormat::Opus => {
                if self.decoder.is_none() {
                    self.decoder = Some(OpusStreamDecoder::new()?);
                }
                let decoder = self.decoder.as_mut().expect("decoder was just installed");
                decoder.decode(frame)?
            }
            AudioFormat::Pcm => pcm_bytes_to_samples(frame),
        };
        self.pcm_buffer.extend_from_slice(&samples);

        let mut outcome = VadOutcome::default();
        while self.pcm_buffer.len() >= CHUNK_SAMPLES {
            let chunk: Vec<i16> = self.pcm_buffer.drain(..CHUNK_SAMPLES).collect();
            let score = self.scorer.score(&chunk);

            let is_voice = if score >= self.config.threshold {
                true
            } else if score <= self.config.threshold_low {
                false
            } else {
                self.last_is_voice
            };
            self.last_is_voice = is_voice;

            if self.window.len() == WINDOW_CHUNKS {
                self.window.pop_front();
            }
            self.window.push_back(is_voice);
            let voice_chunks = self.window.iter().filter(|&&v| v).count();
            outcome.have_voice = voice_chunks >= self.config.frame_window_threshold;

            if ctx.have_voice() && !outcome.have_voice {
                let silence = now_ms().saturating_sub(self.last_voice_ms);
                if silence >= self.config.min_silence_duration_ms {
                    ctx.set_voice_stopped(true);
                    outcome.speech_stopped = true;
                }
            }
            if outcome.have_voice {
                if !ctx.have_voice() {
                    outcome.speech_started = true;
                }
                ctx.set_have_voice(true);
                ctx.touch();
                self.last_voice_ms = now_ms();
            }
        }
        Ok(outcome)
    }

    /// Forget classification state after an utterance is snapshotted.
    pub fn reset(&mut self) {
        self.pcm_buffer.clear();
        self.window.clear();
        self.last_is_voice = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voice_gateway_config::GatewayConfig;

    /// Replays a scripted score per chunk.
    struct ScriptedScorer {
        scores: Vec<f32>,
        index: usize,
    }

    impl VadScorer for ScriptedScorer {
        fn score(&mut self, _chunk: &[i16]) -> f32 {
            let score = self.scores[self.index.min(self.scores.len() - 1)];
            self.index += 1;
            score
        }
    }

    fn ctx() -> std::sync::Arc<SessionContext> {
        let ctx = SessionContext::new("s1", None, None, None, false, GatewayConfig::default());
        ctx.set_audio_format(AudioFormat::Pcm);
        ctx
    }

    fn pcm_frame() -> Vec<u8> {
        vec![0u8; CHUNK_SAMPLES * 2]
    }

    fn processor(scores: Vec<f32>) -> VadProcessor {
        let mut config = VadConfig::default();
        config.min_silence_duration_ms = 0;
        VadProcessor::new(config, Box::new(ScriptedScorer { scores, index: 0 }))
    }

    #[test]
    fn three_of_five_chunks_flip_have_voice() {
        let session = ctx();
        let mut vad = processor(vec![0.9, 0.9, 0.1, 0.9, 0.1]);

        let mut started = false;
        for _ in 0..4 {
            let outcome = vad.process(&session, &pcm_frame()).unwrap();
            started |= outcome.speech_started;
        }
        assert!(started);
        assert!(session.have_voice());
    }

    #[test]
    fn hysteresis_carries_previous_classification() {
        let session = ctx();
        // 0.9 → voice; 0.35 is between the thresholds so it stays voice;
        // 0.1 → silence; 0.35 now stays silence.
        let mut vad = processor(vec![0.9, 0.35, 0.1, 0.35]);
        for _ in 0..2 {
            vad.process(&session, &pcm_frame()).unwrap();
        }
        assert!(vad.last_is_voice);
        for _ in 0..2 {
            vad.process(&session, &pcm_frame()).unwrap();
        }
        assert!(!vad.last_is_voice);
    }

    #[test]
    fn silence_after_voice_sets_voice_stopped() {
        let session = ctx();
        let mut vad = processor(vec![0.9, 0.9, 0.9, 0.0, 0.0, 0.0, 0.0]);

        for _ in 0..7 {
            vad.process(&session, &pcm_frame()).unwrap();
        }
        assert!(session.voice_stopped());
    }

    #[test]
    fn manual_mode_bypasses_classification() {
        let session = ctx();
        session.set_listen_mode(ListenMode::Manual);
        let mut vad = processor(vec![0.0]);

        let outcome = vad.process(&session, &pcm_frame()).unwrap();
        assert!(outcome.have_voice);
        // The session flags stay untouched; control frames own them.
        assert!(!session.have_voice());
    }

    #[test]
    fn energy_scorer_separates_silence_from_tone() {
        let mut scorer = EnergyScorer::default();
        let silence = vec![0i16; CHUNK_SAMPLES];
        let loud: Vec<i16> = (0..CHUNK_SAMPLES)
            .map(|i| if i % 2 == 0 { 12_000 } else { -12_000 })
            .collect();
        assert!(scorer.score(&silence) < 0.1);
        assert!(scorer.score(&loud) > 0.8);
    }
}
