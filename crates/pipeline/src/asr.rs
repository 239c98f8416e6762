//! Per-session recognition adapter
//!
//! Accumulates inbound frames into an utterance buffer. In `auto` and
//! `realtime` modes the VAD label drives accumulation; in `manual` mode the
//! control-frame driven `voice_stopped` flag does. When the utterance ends
//! the buffer is snapshotted, recognition and speaker identification run in
//! parallel, and a final transcript is published.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

use voice_gateway_core::text::remove_punctuation_and_length;
use voice_gateway_core::{
    AudioFormat, Event, EventBus, EventPayload, ListenMode, SessionContext,
};

use crate::codec::{pcm_bytes_to_samples, samples_to_wav, OpusStreamDecoder};
use crate::providers::{AsrEngine, VoiceprintProvider};
use crate::PipelineError;

/// Frames kept as pre-roll while the session is silent, so the utterance
/// head is not clipped.
const IDLE_PREROLL_FRAMES: usize = 10;

pub struct AsrAdapter {
    engine: Arc<dyn AsrEngine>,
    voiceprint: Option<Arc<dyn VoiceprintProvider>>,
    bus: Arc<EventBus>,
    buffer: Mutex<Vec<Vec<u8>>>,
    /// Minimum buffered packets for an utterance to be worth recognizing;
    /// shorter runs are treated as noise.
    min_packets: usize,
}

impl AsrAdapter {
    pub fn new(
        engine: Arc<dyn AsrEngine>,
        voiceprint: Option<Arc<dyn VoiceprintProvider>>,
        bus: Arc<EventBus>,
        min_packets: usize,
    ) -> Self {
        Self {
            engine,
            voiceprint,
            bus,
            buffer: Mutex::new(Vec::new()),
            min_packets,
        }
    }

    /// Feed one inbound frame, with the VAD's label for it.
    pub async fn receive_audio(
        &self,
        ctx: &Arc<SessionContext>,
        frame: Bytes,
        frame_has_voice: bool,
    ) -> Result<(), PipelineError> {
        let have_voice = match ctx.listen_mode() {
            ListenMode::Auto | ListenMode::Realtime => frame_has_voice,
            ListenMode::Manual => ctx.have_voice(),
        };

        {
            let mut buffer = self.buffer.lock();
            buffer.push(frame.to_vec());
            if !have_voice && !ctx.have_voice() {
                let len = buffer.len();
                if len > IDLE_PREROLL_FRAMES {
                    buffer.drain(..len - IDLE_PREROLL_FRAMES);
                }
                return Ok(());
            }
        }

        if ctx.voice_stopped() {
            let utterance: Vec<Vec<u8>> = std::mem::take(&mut *self.buffer.lock());
            ctx.reset_vad_state();

            if utterance.len() > self.min_packets {
                self.finish_utterance(ctx, utterance).await?;
            } else {
                tracing::debug!(
                    session_id = %ctx.session_id,
                    packets = utterance.len(),
                    "utterance too short, dropped as noise"
                );
            }
        }
        Ok(())
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }

    pub fn buffered_frames(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Recognize the snapshot, identify the speaker in parallel, publish
    /// the transcript.
    async fn finish_utterance(
        &self,
        ctx: &Arc<SessionContext>,
        utterance: Vec<Vec<u8>>,
    ) -> Result<(), PipelineError> {
        let format = ctx.audio_format();
        let session_id = ctx.session_id.clone();

        let recognition = self
            .engine
            .speech_to_text(utterance.clone(), &session_id, format);

        let speaker = async {
            let Some(voiceprint) = self.voiceprint.as_ref() else {
                return None;
            };
            let wav = match utterance_to_wav(&utterance, format) {
                Ok(wav) => wav,
                Err(err) => {
                    tracing::warn!(error = %err, "wav render for voiceprint failed");
                    return None;
                }
            };
            match voiceprint.identify_speaker(wav, &session_id).await {
                Ok(name) => name,
                Err(err) => {
                    tracing::warn!(error = %err, "speaker identification failed");
                    None
                }
            }
        };

        let (recognized, speaker_name) = tokio::join!(recognition, speaker);
        let (raw_text, _source_path) = match recognized {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(session_id = %session_id, error = %err, "recognition failed");
                return Err(err);
            }
        };

        let (length, _) = remove_punctuation_and_length(&raw_text);
        if length == 0 {
            tracing::debug!(session_id = %session_id, "empty recognition result suppressed");
            return Ok(());
        }
        tracing::info!(session_id = %session_id, text = %raw_text, "transcript ready");

        let text = match speaker_name {
            Some(speaker) => serde_json::json!({ "speaker": speaker, "content": raw_text }).to_string(),
            None => raw_text,
        };
        self.bus
            .publish(Event::new(
                session_id,
                EventPayload::TranscriptReady {
                    text,
                    is_final: true,
                    confidence: None,
                },
            ))
            .await;
        Ok(())
    }
}

fn utterance_to_wav(frames: &[Vec<u8>], format: AudioFormat) -> Result<Vec<u8>, PipelineError> {
    let mut pcm = Vec::new();
    match format {
        AudioFormat::Pcm => {
            for frame in frames {
                pcm.extend(pcm_bytes_to_samples(frame));
            }
        }
        AudioFormat::Opus => {
            let mut decoder = OpusStreamDecoder::new()?;
            for frame in frames {
                match decoder.decode(frame) {
                    Ok(samples) => pcm.extend(samples),
                    Err(err) => tracing::debug!(error = %err, "undecodable frame skipped"),
                }
            }
        }
    }
    samples_to_wav(&pcm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use voice_gateway_config::GatewayConfig;
    use voice_gateway_core::EventKind;

    struct FixedEngine {
        text: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AsrEngine for FixedEngine {
        async fn speech_to_text(
            &self,
            _frames: Vec<Vec<u8>>,
            _session_id: &str,
            _format: AudioFormat,
        ) -> Result<(String, Option<PathBuf>), PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((self.text.clone(), None))
        }
    }

    struct FixedSpeaker;

    #[async_trait]
    impl VoiceprintProvider for FixedSpeaker {
        async fn identify_speaker(
            &self,
            _wav: Vec<u8>,
            _session_id: &str,
        ) -> Result<Option<String>, PipelineError> {
            Ok(Some("张三".to_string()))
        }
    }

    fn pcm_ctx() -> Arc<SessionContext> {
        let ctx = SessionContext::new("s1", None, None, None, false, GatewayConfig::default());
        ctx.set_audio_format(AudioFormat::Pcm);
        ctx
    }

    fn transcripts(bus: &Arc<EventBus>) -> Arc<parking_lot::Mutex<Vec<String>>> {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        bus.subscribe_sync(EventKind::TranscriptReady, move |event| {
            if let EventPayload::TranscriptReady { text, .. } = &event.payload {
                seen2.lock().push(text.clone());
            }
        });
        seen
    }

    async fn feed_utterance(adapter: &AsrAdapter, ctx: &Arc<SessionContext>, frames: usize) {
        ctx.set_have_voice(true);
        for _ in 0..frames - 1 {
            adapter
                .receive_audio(ctx, Bytes::from(vec![1u8; 320]), true)
                .await
                .unwrap();
        }
        ctx.set_voice_stopped(true);
        adapter
            .receive_audio(ctx, Bytes::from(vec![1u8; 320]), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn utterance_is_recognized_and_published() {
        let bus = Arc::new(EventBus::new());
        let seen = transcripts(&bus);
        let engine = Arc::new(FixedEngine {
            text: "打开灯".into(),
            calls: AtomicUsize::new(0),
        });
        let adapter = AsrAdapter::new(engine.clone(), None, bus, 15);
        let ctx = pcm_ctx();

        feed_utterance(&adapter, &ctx, 20).await;

        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().clone(), vec!["打开灯".to_string()]);
        assert!(!ctx.have_voice());
        assert!(!ctx.voice_stopped());
        assert_eq!(adapter.buffered_frames(), 0);
    }

    #[tokio::test]
    async fn short_utterances_are_noise() {
        let bus = Arc::new(EventBus::new());
        let seen = transcripts(&bus);
        let engine = Arc::new(FixedEngine {
            text: "噪音".into(),
            calls: AtomicUsize::new(0),
        });
        let adapter = AsrAdapter::new(engine.clone(), None, bus, 15);
        let ctx = pcm_ctx();

        feed_utterance(&adapter, &ctx, 5).await;

        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn idle_buffer_keeps_only_preroll() {
        let bus = Arc::new(EventBus::new());
        let engine = Arc::new(FixedEngine {
            text: String::new(),
            calls: AtomicUsize::new(0),
        });
        let adapter = AsrAdapter::new(engine, None, bus, 15);
        let ctx = pcm_ctx();

        for _ in 0..40 {
            adapter
                .receive_audio(&ctx, Bytes::from(vec![0u8; 320]), false)
                .await
                .unwrap();
        }
        assert_eq!(adapter.buffered_frames(), IDLE_PREROLL_FRAMES);
    }

    #[tokio::test]
    async fn empty_recognition_is_suppressed() {
        let bus = Arc::new(EventBus::new());
        let seen = transcripts(&bus);
        let engine = Arc::new(FixedEngine {
            text: "。。".into(),
            calls: AtomicUsize::new(0),
        });
        let adapter = AsrAdapter::new(engine, None, bus, 15);
        let ctx = pcm_ctx();

        feed_utterance(&adapter, &ctx, 20).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn speaker_wraps_transcript_in_envelope() {
        let bus = Arc::new(EventBus::new());
        let seen = transcripts(&bus);
        let engine = Arc::new(FixedEngine {
            text: "打开灯".into(),
            calls: AtomicUsize::new(0),
        });
        let adapter = AsrAdapter::new(engine, Some(Arc::new(FixedSpeaker)), bus, 15);
        let ctx = pcm_ctx();

        feed_utterance(&adapter, &ctx, 20).await;

        let got = seen.lock().clone();
        let parsed: serde_json::Value = serde_json::from_str(&got[0]).unwrap();
        assert_eq!(parsed["speaker"], "张三");
        assert_eq!(parsed["content"], "打开灯");
    }

    #[tokio::test]
    async fn manual_mode_accumulates_until_voice_stopped() {
        let bus = Arc::new(EventBus::new());
        let seen = transcripts(&bus);
        let engine = Arc::new(FixedEngine {
            text: "手动模式".into(),
            calls: AtomicUsize::new(0),
        });
        let adapter = AsrAdapter::new(engine.clone(), None, bus, 15);
        let ctx = pcm_ctx();
        ctx.set_listen_mode(ListenMode::Manual);

        // listen.start sets have_voice; VAD says silence throughout.
        ctx.set_have_voice(true);
        for _ in 0..20 {
            adapter
                .receive_audio(&ctx, Bytes::from(vec![1u8; 320]), false)
                .await
                .unwrap();
        }
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);

        // listen.stop sets voice_stopped; next frame flushes.
        ctx.set_voice_stopped(true);
        adapter
            .receive_audio(&ctx, Bytes::from(vec![1u8; 320]), false)
            .await
            .unwrap();
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().clone(), vec!["手动模式".to_string()]);
    }
}
