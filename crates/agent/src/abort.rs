//! Abort handling
//!
//! A `ClientAbort`, whether from a device `abort` frame or a barge-in,
//! flips the session's abort flag, clears the TTS queues, drops any
//! buffered recognition audio, and tells the device to stop playback.

use std::sync::Arc;

use voice_gateway_core::{Container, Event, EventBus, EventKind, EventPayload, SessionContext};
use voice_gateway_pipeline::{AsrAdapter, TtsOrchestrator};

use crate::service_names;

pub struct AbortService {
    container: Arc<Container>,
    orchestrator: Arc<TtsOrchestrator>,
}

impl AbortService {
    pub fn new(container: Arc<Container>, orchestrator: Arc<TtsOrchestrator>) -> Arc<Self> {
        Arc::new(Self {
            container,
            orchestrator,
        })
    }

    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        let service = self.clone();
        bus.subscribe(EventKind::ClientAbort, move |event| {
            let service = service.clone();
            async move { service.handle_abort(event).await }
        });
    }

    async fn handle_abort(&self, event: Event) {
        let session_id = event.session_id;
        let reason = match event.payload {
            EventPayload::ClientAbort { reason } => reason,
            _ => return,
        };
        tracing::info!(%session_id, reason = reason.as_str(), "abort requested");

        if let Ok(ctx) = self
            .container
            .resolve_typed::<SessionContext>(service_names::SESSION_CONTEXT, Some(&session_id))
        {
            ctx.set_client_abort(true);
            ctx.set_speaking(false);
            ctx.set_llm_finished(true);
        }
        if let Ok(asr) = self
            .container
            .resolve_typed::<AsrAdapter>(service_names::ASR_ADAPTER, Some(&session_id))
        {
            asr.clear();
        }
        self.orchestrator.abort(&session_id).await;
    }
}
