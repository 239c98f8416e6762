//! TTS orchestration and the audio-paced sender
//!
//! Two FIFOs per session: the text queue carries [`TtsMessage`] entries
//! produced by the dialogue layer, a background synthesizer turns them into
//! [`AudioChunk`]s on the audio queue, and the paced sender drains that
//! queue onto the transport under the timing contract:
//!
//! - the first `pre_buffer_frames` frames of a turn go out back-to-back;
//! - frame `k` after the pre-buffer is sent no earlier than
//!   `turn_start + k × frame_duration`; a late loop catches up without
//!   busy-waiting, an early one sleeps;
//! - a positive `tts_audio_send_delay_ms` replaces the derived schedule
//!   with a fixed per-frame sleep;
//! - exactly one `{"type":"tts","state":"start"}` and one `"stop"` bracket
//!   every turn, with `sentence_start` captions in between;
//! - pacing counters reset when the turn (`sentence_id`) changes;
//! - an abort clears both queues and emits `stop` immediately.
//!
//! The stop for a turn can be produced by two tasks (the sender draining
//! the turn's LAST chunk, or an abort racing it); the session records which
//! turn already got its stop so only the first emitter wins.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

use voice_gateway_core::{
    now_ms, AudioChunk, ContentType, Event, EventBus, EventPayload, SentenceType, SessionContext,
    TtsMessage,
};
use voice_gateway_transport::{AudioHeader, Transport};

use crate::codec::load_wav_as_opus_frames;
use crate::providers::TtsEngine;
use crate::queue::ClearableQueue;

pub struct TtsOrchestrator {
    engine: Arc<dyn TtsEngine>,
    bus: Arc<EventBus>,
    sessions: DashMap<String, Arc<TtsSession>>,
}

struct TtsSession {
    ctx: Arc<SessionContext>,
    transport: Arc<dyn Transport>,
    text_queue: Arc<ClearableQueue<TtsMessage>>,
    audio_queue: Arc<ClearableQueue<AudioChunk>>,
    /// Turn whose `stop` has already been sent.
    stop_sent: Mutex<Option<String>>,
}

impl TtsSession {
    /// Claim the right to send the stop for `sentence_id`. Only the first
    /// caller per turn gets `true`.
    fn mark_stop_sent(&self, sentence_id: &str) -> bool {
        let mut stopped = self.stop_sent.lock();
        if stopped.as_deref() == Some(sentence_id) {
            false
        } else {
            *stopped = Some(sentence_id.to_string());
            true
        }
    }
}

impl TtsOrchestrator {
    pub fn new(engine: Arc<dyn TtsEngine>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            bus,
            sessions: DashMap::new(),
        })
    }

    /// Open the session's queues and start its synthesizer and sender
    /// tasks. Called from the session-created lifecycle hook.
    pub fn register(&self, ctx: Arc<SessionContext>, transport: Arc<dyn Transport>) {
        let session = Arc::new(TtsSession {
            ctx: ctx.clone(),
            transport,
            text_queue: Arc::new(ClearableQueue::new()),
            audio_queue: Arc::new(ClearableQueue::new()),
            stop_sent: Mutex::new(None),
        });
        self.sessions
            .insert(ctx.session_id.clone(), session.clone());

        tokio::spawn(synthesizer_loop(
            session.clone(),
            self.engine.clone(),
            self.bus.clone(),
        ));
        tokio::spawn(sender_loop(session, self.bus.clone()));
    }

    /// Close the queues; both tasks drain and exit.
    pub fn unregister(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            session.text_queue.close();
            session.audio_queue.close();
        }
    }

    fn session(&self, session_id: &str) -> Option<Arc<TtsSession>> {
        let found = self.sessions.get(session_id).map(|s| s.clone());
        if found.is_none() {
            tracing::warn!(session_id, "tts session not registered");
        }
        found
    }

    /// Push the turn-opening marker.
    pub fn add_first(&self, session_id: &str) {
        if let Some(session) = self.session(session_id) {
            let sid = session.ctx.sentence_id_or_mint();
            session
                .text_queue
                .push(TtsMessage::action(sid, SentenceType::First));
        }
    }

    /// Push one sentence of assistant text.
    pub fn add_text(&self, session_id: &str, text: impl Into<String>) {
        if let Some(session) = self.session(session_id) {
            let sid = session.ctx.sentence_id_or_mint();
            session.text_queue.push(TtsMessage::text(sid, text));
        }
    }

    /// Push the turn-closing marker.
    pub fn add_last(&self, session_id: &str) {
        if let Some(session) = self.session(session_id) {
            let sid = session.ctx.sentence_id_or_mint();
            session
                .text_queue
                .push(TtsMessage::action(sid, SentenceType::Last));
        }
    }

    /// Queue a pre-recorded clip inside the current turn.
    pub fn play_file(&self, session_id: &str, path: std::path::PathBuf) {
        if let Some(session) = self.session(session_id) {
            let sid = session.ctx.sentence_id_or_mint();
            session.text_queue.push(TtsMessage::file(sid, path));
        }
    }

    /// The atomic unit FIRST + TEXT + LAST.
    pub fn synthesize_one_sentence(&self, session_id: &str, text: impl Into<String>) {
        self.add_first(session_id);
        self.add_text(session_id, text);
        self.add_last(session_id);
    }

    /// Enqueue already-encoded audio directly on the audio queue, with an
    /// explicit boundary. Used by the binding and policy-clip flows.
    pub fn push_audio_chunk(
        &self,
        session_id: &str,
        boundary: SentenceType,
        frames: Vec<Vec<u8>>,
        caption: Option<String>,
    ) {
        if let Some(session) = self.session(session_id) {
            let sid = session.ctx.sentence_id_or_mint();
            session.audio_queue.push(AudioChunk {
                sentence_id: sid,
                boundary,
                frames,
                caption,
            });
        }
    }

    /// Abort the current turn: clear both queues and tell the device to
    /// stop playback right away. The stop is suppressed when the sender
    /// already emitted the turn's stop, so a turn never gets two brackets.
    pub async fn abort(&self, session_id: &str) {
        let Some(session) = self.session(session_id) else {
            return;
        };
        session.text_queue.clear();
        session.audio_queue.clear();
        session.ctx.set_speaking(false);
        session.ctx.set_llm_finished(true);

        let first_stop = match session.ctx.sentence_id() {
            Some(turn) => session.mark_stop_sent(&turn),
            None => true,
        };
        if !first_stop {
            return;
        }
        let stop = serde_json::json!({
            "type": "tts",
            "state": "stop",
            "session_id": session_id,
        });
        if let Err(err) = session.transport.send_json(&stop).await {
            tracing::debug!(session_id, error = %err, "stop notification failed");
        }
    }

    #[cfg(test)]
    fn queue_depths(&self, session_id: &str) -> (usize, usize) {
        let session = self.sessions.get(session_id).unwrap();
        (session.text_queue.len(), session.audio_queue.len())
    }
}

/// Drains the text queue into encoded audio chunks.
async fn synthesizer_loop(
    session: Arc<TtsSession>,
    engine: Arc<dyn TtsEngine>,
    bus: Arc<EventBus>,
) {
    // True between a turn's FIRST marker and its first synthesized audio:
    // that chunk inherits the FIRST boundary and carries the caption.
    let mut first_pending = false;

    while let Some(message) = session.text_queue.pop().await {
        match message.content_type {
            ContentType::Action => {
                if message.sentence_type == SentenceType::First {
                    first_pending = true;
                }
                session
                    .audio_queue
                    .push(AudioChunk::boundary(message.sentence_id, message.sentence_type));
            }
            ContentType::Text => {
                let text = message.text.unwrap_or_default();
                if text.is_empty() {
                    continue;
                }
                match engine.synthesize(&text).await {
                    Ok(frames) => {
                        let boundary = if std::mem::take(&mut first_pending) {
                            SentenceType::First
                        } else {
                            SentenceType::Middle
                        };
                        session.audio_queue.push(AudioChunk {
                            sentence_id: message.sentence_id,
                            boundary,
                            frames,
                            caption: Some(text),
                        });
                    }
                    Err(err) => {
                        tracing::error!(
                            session_id = %session.ctx.session_id,
                            error = %err,
                            "synthesis failed"
                        );
                        bus.publish(Event::new(
                            session.ctx.session_id.clone(),
                            EventPayload::TtsError {
                                message: err.to_string(),
                            },
                        ))
                        .await;
                    }
                }
            }
            ContentType::File => {
                let Some(path) = message.file else { continue };
                match load_wav_as_opus_frames(&path) {
                    Ok(frames) => {
                        let boundary = if std::mem::take(&mut first_pending) {
                            SentenceType::First
                        } else {
                            SentenceType::Middle
                        };
                        session.audio_queue.push(AudioChunk {
                            sentence_id: message.sentence_id,
                            boundary,
                            frames,
                            caption: None,
                        });
                    }
                    Err(err) => {
                        tracing::error!(path = %path.display(), error = %err, "clip load failed");
                    }
                }
            }
        }
    }
}

struct FlowControl {
    sentence_id: String,
    start: Instant,
    start_epoch_ms: u64,
    sent_packets: u64,
    sequence: u32,
    started: bool,
}

impl FlowControl {
    fn reset(&mut self, sentence_id: String) {
        self.sentence_id = sentence_id;
        self.start = Instant::now();
        self.start_epoch_ms = now_ms();
        self.sent_packets = 0;
        self.sequence = 0;
        self.started = false;
    }
}

/// Drains the audio queue onto the transport under the pacing contract.
async fn sender_loop(session: Arc<TtsSession>, bus: Arc<EventBus>) {
    let ctx = &session.ctx;
    let mut flow = FlowControl {
        sentence_id: String::new(),
        start: Instant::now(),
        start_epoch_ms: now_ms(),
        sent_packets: 0,
        sequence: 0,
        started: false,
    };

    while let Some(chunk) = session.audio_queue.pop().await {
        if chunk.sentence_id != flow.sentence_id {
            flow.reset(chunk.sentence_id.clone());
        }

        if chunk.boundary == SentenceType::First {
            if !flow.started {
                flow.started = true;
                ctx.touch();
                ctx.set_speaking(true);
                send_state(&session, "start", None).await;
                bus.publish(Event::new(
                    ctx.session_id.clone(),
                    EventPayload::ClientSpeakingState { speaking: true },
                ))
                .await;
            }
            if chunk.caption.is_some() {
                send_state(&session, "sentence_start", chunk.caption.as_deref()).await;
            }
        }

        for frame in &chunk.frames {
            if ctx.client_abort() {
                break;
            }
            pace(&mut flow, ctx).await;
            send_frame(&session, &mut flow, frame).await;
        }

        // An aborted turn gets its stop from the abort path; sending the
        // drained LAST marker's stop too would double-bracket the turn.
        if chunk.boundary == SentenceType::Last && !ctx.client_abort() {
            finish_turn(&session, &bus, &mut flow).await;
        }
    }
}

async fn pace(flow: &mut FlowControl, ctx: &SessionContext) {
    let config = ctx.config();
    let pre_buffer = config.tts.pre_buffer_frames as u64;
    if flow.sent_packets < pre_buffer {
        return;
    }
    if config.tts.tts_audio_send_delay_ms > 0 {
        sleep(Duration::from_millis(
            config.tts.tts_audio_send_delay_ms as u64,
        ))
        .await;
        return;
    }
    let frame_ms = config.tts.frame_duration_ms;
    let effective = flow.sent_packets - pre_buffer;
    let expected = flow.start + Duration::from_millis(effective * frame_ms);
    let now = Instant::now();
    if expected > now {
        sleep(expected - now).await;
    } else {
        // Behind schedule: shift the baseline instead of busy-catching-up.
        flow.start += now - expected;
    }
}

async fn send_frame(session: &TtsSession, flow: &mut FlowControl, frame: &[u8]) {
    let ctx = &session.ctx;
    let frame_ms = ctx.config().tts.frame_duration_ms;

    let result = if ctx.from_gateway {
        let timestamp =
            (flow.start_epoch_ms.wrapping_add(flow.sent_packets * frame_ms)) as u32;
        let header = AudioHeader::new(1, flow.sequence, timestamp, frame.len() as u32);
        session.transport.send_binary(&header.wrap(frame)).await
    } else {
        session.transport.send_binary(frame).await
    };
    if let Err(err) = result {
        tracing::debug!(session_id = %ctx.session_id, error = %err, "audio send failed");
        return;
    }
    ctx.set_speaking(true);
    flow.sent_packets += 1;
    flow.sequence = flow.sequence.wrapping_add(1);
}

async fn finish_turn(session: &TtsSession, bus: &Arc<EventBus>, flow: &mut FlowControl) {
    let ctx = &session.ctx;
    let config = ctx.config();
    flow.started = false;

    // An abort that landed between the dequeue and here owns the stop.
    if ctx.client_abort() {
        return;
    }

    // Optional notification clip before the stop marker.
    if config.tts.enable_stop_tts_notify {
        match load_wav_as_opus_frames(&config.tts.stop_tts_notify_voice) {
            Ok(frames) => {
                for frame in &frames {
                    pace(flow, ctx).await;
                    send_frame(session, flow, frame).await;
                }
            }
            Err(err) => tracing::debug!(error = %err, "stop notify clip unavailable"),
        }
    }

    if session.mark_stop_sent(&flow.sentence_id) {
        send_state(session, "stop", None).await;
        ctx.set_speaking(false);
        bus.publish(Event::new(
            ctx.session_id.clone(),
            EventPayload::ClientSpeakingState { speaking: false },
        ))
        .await;
    }

    if ctx.close_after_chat() {
        tracing::info!(session_id = %ctx.session_id, "closing session after final turn");
        bus.publish(Event::new(
            ctx.session_id.clone(),
            EventPayload::SessionDestroying,
        ))
        .await;
    }
}

async fn send_state(session: &TtsSession, state: &str, text: Option<&str>) {
    let mut message = serde_json::json!({
        "type": "tts",
        "state": state,
        "session_id": session.ctx.session_id,
    });
    if let Some(text) = text {
        message["text"] = serde_json::Value::String(text.to_string());
    }
    if let Err(err) = session.transport.send_json(&message).await {
        tracing::debug!(
            session_id = %session.ctx.session_id,
            state,
            error = %err,
            "tts state send failed"
        );
    }
}
