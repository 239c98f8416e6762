//! Audio intake service
//!
//! Subscribes to `AudioDataReceived`: runs the frame through the session's
//! VAD, honors the post-wake suppression window, fires barge-in aborts, and
//! feeds the recognition adapter.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use voice_gateway_core::events::AbortReason;
use voice_gateway_core::{
    Container, Event, EventBus, EventKind, EventPayload, ListenMode, SessionContext,
};
use voice_gateway_pipeline::{AsrAdapter, VadProcessor};

use crate::service_names;

/// How long VAD output is ignored after a wake word.
const WAKE_SUPPRESSION: Duration = Duration::from_secs(2);

pub struct AudioService {
    container: Arc<Container>,
    bus: Arc<EventBus>,
    resume_pending: DashMap<String, ()>,
}

impl AudioService {
    pub fn new(container: Arc<Container>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            container,
            bus,
            resume_pending: DashMap::new(),
        })
    }

    /// Wire the service onto the bus.
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        let service = self.clone();
        bus.subscribe(EventKind::AudioDataReceived, move |event| {
            let service = service.clone();
            async move { service.handle_audio(event).await }
        });
    }

    async fn handle_audio(self: Arc<Self>, event: Event) {
        let session_id = event.session_id.clone();
        let EventPayload::AudioDataReceived { data } = event.payload else {
            return;
        };

        let Ok(ctx) = self
            .container
            .resolve_typed::<SessionContext>(service_names::SESSION_CONTEXT, Some(&session_id))
        else {
            tracing::debug!(%session_id, "audio for unknown session dropped");
            return;
        };
        let Ok(vad) = self
            .container
            .resolve_typed::<Mutex<VadProcessor>>(service_names::VAD, Some(&session_id))
        else {
            return;
        };
        let Ok(asr) = self
            .container
            .resolve_typed::<AsrAdapter>(service_names::ASR_ADAPTER, Some(&session_id))
        else {
            return;
        };

        let outcome = match vad.lock().process(&ctx, &data) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::debug!(%session_id, error = %err, "vad rejected frame");
                return;
            }
        };

        // Freshly woken devices hear their own greeting; ignore the VAD and
        // drop buffered audio until the suppression window passes.
        if ctx.just_woken_up() {
            asr.clear();
            if self.resume_pending.insert(session_id.clone(), ()).is_none() {
                let service = self.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(WAKE_SUPPRESSION).await;
                    ctx.set_just_woken_up(false);
                    service.resume_pending.remove(&ctx.session_id);
                });
            }
            return;
        }

        if outcome.speech_started {
            self.bus
                .publish(Event::new(session_id.clone(), EventPayload::VadSpeechStart))
                .await;
        }
        if outcome.speech_stopped {
            self.bus
                .publish(Event::new(session_id.clone(), EventPayload::VadSpeechEnd))
                .await;
        }

        // Barge-in: voice while the server is speaking aborts the current
        // turn, except in push-to-talk mode.
        if outcome.have_voice
            && ctx.is_speaking()
            && ctx.listen_mode() != ListenMode::Manual
        {
            self.bus
                .publish(Event::new(
                    session_id.clone(),
                    EventPayload::ClientAbort {
                        reason: AbortReason::UserInterrupt,
                    },
                ))
                .await;
        }

        if let Err(err) = asr.receive_audio(&ctx, data, outcome.have_voice).await {
            tracing::warn!(%session_id, error = %err, "recognition intake failed");
        }
    }
}
