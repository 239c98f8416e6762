//! Application state and wiring
//!
//! `AppState::build` assembles the container, the event bus, the global
//! services and the per-provider plumbing once at startup;
//! [`wire_session`] attaches the per-session pieces (transport handle, VAD,
//! recognition adapter, TTS queues, stop hooks) when a connection is
//! accepted.

use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;

use voice_gateway_agent::{
    service_names, AbortService, AudioService, DialogueService, IntentService, OutputCounter,
    WakeupCache,
};
use voice_gateway_config::{GatewayConfig, ManagerApiClient};
use voice_gateway_core::{Container, EventBus, SessionContext};
use voice_gateway_llm::{IntentModel, LanguageModel, MemoryProvider};
use voice_gateway_pipeline::{
    AsrAdapter, AsrEngine, SharedAsrHandle, SharedAsrPool, TtsEngine, TtsOrchestrator,
    VadProcessor, VoiceprintProvider,
};
use voice_gateway_tools::{global_registry, ToolDispatcher};
use voice_gateway_transport::{SharedTransport, Transport, UdpAudioEndpoint};

use crate::auth::AuthGate;
use crate::router::MessageRouter;
use crate::sessions::SessionManager;

/// Everything model-shaped the gateway orchestrates but does not implement.
#[derive(Clone)]
pub struct ProviderSet {
    pub asr: Arc<dyn AsrEngine>,
    pub tts: Arc<dyn TtsEngine>,
    pub llm: Arc<dyn LanguageModel>,
    pub intent: Option<Arc<dyn IntentModel>>,
    pub memory: Option<Arc<dyn MemoryProvider>>,
    pub voiceprint: Option<Arc<dyn VoiceprintProvider>>,
}

impl ProviderSet {
    /// Placeholders that keep the gateway running without any provider.
    pub fn placeholders() -> Self {
        Self {
            asr: crate::providers::placeholder_asr(),
            tts: crate::providers::placeholder_tts(),
            llm: crate::providers::placeholder_llm(),
            intent: None,
            memory: None,
            voiceprint: None,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<GatewayConfig>>,
    pub config_path: Option<PathBuf>,
    pub container: Arc<Container>,
    pub bus: Arc<EventBus>,
    pub sessions: Arc<SessionManager>,
    pub router: Arc<MessageRouter>,
    pub auth: Arc<AuthGate>,
    pub orchestrator: Arc<TtsOrchestrator>,
    pub providers: ProviderSet,
    /// Present when local inference runs behind the shared pool.
    pub asr_pool: Option<Arc<SharedAsrPool>>,
    /// Present when the broker transport is enabled.
    pub udp: Option<Arc<UdpAudioEndpoint>>,
}

impl AppState {
    pub async fn build(
        config: GatewayConfig,
        config_path: Option<PathBuf>,
        providers: ProviderSet,
    ) -> Self {
        let container = Arc::new(Container::new());
        let bus = Arc::new(EventBus::new());
        let auth = Arc::new(AuthGate::from_config(&config));

        let profile_client = if config.read_config_from_api() {
            Some(Arc::new(ManagerApiClient::new(config.manager_api.clone())))
        } else {
            None
        };
        let sessions = SessionManager::new(container.clone(), bus.clone(), profile_client);
        sessions.register(&bus);

        // Local models share one pool; the instance behind `providers.asr`
        // was loaded eagerly by the caller.
        let asr_pool = if config.stt.local {
            Some(SharedAsrPool::spawn(
                providers.asr.clone(),
                config.stt.queue_max_size,
            ))
        } else {
            None
        };

        let orchestrator = TtsOrchestrator::new(providers.tts.clone(), bus.clone());
        let dispatcher = Arc::new(ToolDispatcher::new(global_registry()));
        let counter = Arc::new(OutputCounter::new());
        let wakeup_cache = Arc::new(WakeupCache::new(config.dialogue.wakeup_cache_dir.clone()));

        let intent = IntentService::new(
            bus.clone(),
            orchestrator.clone(),
            dispatcher.clone(),
            providers.intent.clone(),
            providers.tts.clone(),
            wakeup_cache,
        );
        let dialogue = DialogueService::new(
            container.clone(),
            bus.clone(),
            orchestrator.clone(),
            providers.llm.clone(),
            dispatcher,
            intent,
            providers.memory.clone(),
            counter,
        );
        dialogue.register(&bus);

        let audio = AudioService::new(container.clone(), bus.clone());
        audio.register(&bus);
        let abort = AbortService::new(container.clone(), orchestrator.clone());
        abort.register(&bus);

        let config = Arc::new(RwLock::new(config));
        let router = MessageRouter::new(
            container.clone(),
            bus.clone(),
            config.clone(),
            config_path.clone(),
        );

        Self {
            config,
            config_path,
            container,
            bus,
            sessions,
            router,
            auth,
            orchestrator,
            providers,
            asr_pool,
            udp: None,
        }
    }

    pub fn with_udp(mut self, udp: Arc<UdpAudioEndpoint>) -> Self {
        self.udp = Some(udp);
        self
    }

    /// Recognition engine for one session: the shared-pool handle for local
    /// inference, the provider itself for remote streaming.
    fn session_asr_engine(&self) -> Arc<dyn AsrEngine> {
        match self.asr_pool.as_ref() {
            Some(pool) => Arc::new(SharedAsrHandle::new(pool.clone())),
            None => self.providers.asr.clone(),
        }
    }
}

/// Attach per-session services and lifecycle hooks, then start the
/// lifecycle.
pub async fn wire_session(
    state: &AppState,
    ctx: &Arc<SessionContext>,
    transport: Arc<dyn Transport>,
) {
    let session_id = ctx.session_id.clone();
    let config = ctx.config();

    state.container.register_session_value(
        &session_id,
        service_names::TRANSPORT,
        Arc::new(SharedTransport(transport.clone())),
    );
    state.container.register_session_value(
        &session_id,
        service_names::VAD,
        Arc::new(Mutex::new(VadProcessor::with_energy_scorer(
            config.vad.clone(),
        ))),
    );
    let adapter = Arc::new(AsrAdapter::new(
        state.session_asr_engine(),
        state.providers.voiceprint.clone(),
        state.bus.clone(),
        config.stt.min_utterance_packets,
    ));
    state
        .container
        .register_session_value(&session_id, service_names::ASR_ADAPTER, adapter);

    state.orchestrator.register(ctx.clone(), transport.clone());

    // Stop hooks run in reverse: transport closes first, then the TTS
    // queues, then the memory snapshot.
    if let Some(memory) = state.providers.memory.clone() {
        let dialogue_ctx = ctx.clone();
        ctx.lifecycle.on_stop(move || async move {
            let snapshot = dialogue_ctx.dialogue.lock().snapshot();
            if let Err(err) = memory.save_memory(&snapshot).await {
                tracing::warn!(error = %err, "memory save failed");
            }
            Ok(())
        });
    }
    {
        let orchestrator = state.orchestrator.clone();
        let session_id = session_id.clone();
        ctx.lifecycle.on_stop(move || async move {
            orchestrator.unregister(&session_id);
            Ok(())
        });
    }
    {
        let transport = transport.clone();
        ctx.lifecycle.on_stop(move || async move {
            transport.close().await;
            Ok(())
        });
    }

    ctx.lifecycle.start().await;
}

/// Shared receive loop for both transport variants: route frames until the
/// connection closes or the session stops, then tear down.
pub async fn run_session_loop(
    state: AppState,
    ctx: Arc<SessionContext>,
    transport: Arc<dyn Transport>,
) {
    loop {
        tokio::select! {
            frame = transport.recv() => match frame {
                Some(frame) => state.router.route_frame(&ctx, &transport, frame).await,
                None => {
                    tracing::info!(session_id = %ctx.session_id, "transport closed");
                    break;
                }
            },
            _ = ctx.lifecycle.wait_for_stop() => break,
        }
    }
    state.sessions.destroy_session(&ctx.session_id).await;
}
