//! Session context
//!
//! One instance per live device connection. The context is shared across
//! the session's tasks behind an `Arc`; mutable state is interior, split
//! between atomics for the hot flags and locks for structured state. No
//! back-pointers: components reach each other through the container, keyed
//! by the opaque session id.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use voice_gateway_config::GatewayConfig;

use crate::audio::{AudioFormat, ListenMode};
use crate::dialogue::Dialogue;
use crate::events::now_ms;
use crate::lifecycle::LifecycleManager;

pub type SessionId = String;

pub struct SessionContext {
    // Identity, immutable after creation.
    pub session_id: SessionId,
    pub device_id: Option<String>,
    pub client_id: Option<String>,
    pub client_ip: Option<String>,
    /// Binary frames carry the 16-byte gateway header on this connection.
    pub from_gateway: bool,
    pub created_at_ms: u64,

    /// Effective config: deep copy of server defaults, optionally merged
    /// with the device profile. Swapped wholesale on reload.
    config: RwLock<Arc<GatewayConfig>>,

    // Runtime state.
    audio_format: RwLock<AudioFormat>,
    listen_mode: RwLock<ListenMode>,
    is_speaking: AtomicBool,
    have_voice: AtomicBool,
    voice_stopped: AtomicBool,
    just_woken_up: AtomicBool,
    client_abort: AtomicBool,
    close_after_chat: AtomicBool,
    llm_finish_task: AtomicBool,
    last_activity_ms: AtomicU64,

    // Dialogue state.
    pub dialogue: Mutex<Dialogue>,
    sentence_id: Mutex<Option<String>>,
    tts_message_text: Mutex<String>,
    current_speaker: Mutex<Option<String>>,

    // Binding state.
    need_bind: AtomicBool,
    bind_code: Mutex<Option<String>>,

    // Device-advertised data.
    pub iot_descriptors: Mutex<serde_json::Map<String, Value>>,
    features: Mutex<Option<Value>>,

    pub lifecycle: Arc<LifecycleManager>,
}

impl SessionContext {
    pub fn new(
        session_id: impl Into<SessionId>,
        device_id: Option<String>,
        client_id: Option<String>,
        client_ip: Option<String>,
        from_gateway: bool,
        config: GatewayConfig,
    ) -> Arc<Self> {
        let session_id = session_id.into();
        Arc::new(Self {
            lifecycle: LifecycleManager::new(session_id.clone()),
            session_id,
            device_id,
            client_id,
            client_ip,
            from_gateway,
            created_at_ms: now_ms(),
            config: RwLock::new(Arc::new(config)),
            audio_format: RwLock::new(AudioFormat::Opus),
            listen_mode: RwLock::new(ListenMode::Auto),
            is_speaking: AtomicBool::new(false),
            have_voice: AtomicBool::new(false),
            voice_stopped: AtomicBool::new(false),
            just_woken_up: AtomicBool::new(false),
            client_abort: AtomicBool::new(false),
            close_after_chat: AtomicBool::new(false),
            llm_finish_task: AtomicBool::new(true),
            last_activity_ms: AtomicU64::new(now_ms()),
            dialogue: Mutex::new(Dialogue::new()),
            sentence_id: Mutex::new(None),
            tts_message_text: Mutex::new(String::new()),
            current_speaker: Mutex::new(None),
            need_bind: AtomicBool::new(false),
            bind_code: Mutex::new(None),
            iot_descriptors: Mutex::new(serde_json::Map::new()),
            features: Mutex::new(None),
        })
    }

    // --- config ---

    pub fn config(&self) -> Arc<GatewayConfig> {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: GatewayConfig) {
        *self.config.write() = Arc::new(config);
    }

    /// Idle budget in seconds; the hard close fires a minute after the
    /// configured no-voice window.
    pub fn timeout_seconds(&self) -> u64 {
        self.config().dialogue.close_connection_no_voice_time + 60
    }

    // --- activity ---

    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub fn idle_ms(&self) -> u64 {
        now_ms().saturating_sub(self.last_activity_ms())
    }

    // --- audio negotiation ---

    pub fn audio_format(&self) -> AudioFormat {
        *self.audio_format.read()
    }

    pub fn set_audio_format(&self, format: AudioFormat) {
        *self.audio_format.write() = format;
    }

    pub fn listen_mode(&self) -> ListenMode {
        *self.listen_mode.read()
    }

    pub fn set_listen_mode(&self, mode: ListenMode) {
        *self.listen_mode.write() = mode;
    }

    // --- voice flags ---

    pub fn have_voice(&self) -> bool {
        self.have_voice.load(Ordering::Relaxed)
    }

    pub fn set_have_voice(&self, value: bool) {
        self.have_voice.store(value, Ordering::Relaxed);
    }

    pub fn voice_stopped(&self) -> bool {
        self.voice_stopped.load(Ordering::Relaxed)
    }

    pub fn set_voice_stopped(&self, value: bool) {
        self.voice_stopped.store(value, Ordering::Relaxed);
    }

    pub fn reset_vad_state(&self) {
        self.have_voice.store(false, Ordering::Relaxed);
        self.voice_stopped.store(false, Ordering::Relaxed);
    }

    pub fn just_woken_up(&self) -> bool {
        self.just_woken_up.load(Ordering::Relaxed)
    }

    pub fn set_just_woken_up(&self, value: bool) {
        self.just_woken_up.store(value, Ordering::Relaxed);
    }

    // --- speaking / abort ---

    pub fn is_speaking(&self) -> bool {
        self.is_speaking.load(Ordering::Relaxed)
    }

    pub fn set_speaking(&self, value: bool) {
        self.is_speaking.store(value, Ordering::Relaxed);
    }

    pub fn client_abort(&self) -> bool {
        self.client_abort.load(Ordering::Relaxed)
    }

    pub fn set_client_abort(&self, value: bool) {
        self.client_abort.store(value, Ordering::Relaxed);
    }

    pub fn close_after_chat(&self) -> bool {
        self.close_after_chat.load(Ordering::Relaxed)
    }

    pub fn set_close_after_chat(&self, value: bool) {
        self.close_after_chat.store(value, Ordering::Relaxed);
    }

    // --- turn state ---

    /// Whether the previous LLM turn is complete. Exactly one turn may be
    /// in flight; callers must see `true` here before starting another.
    pub fn llm_finished(&self) -> bool {
        self.llm_finish_task.load(Ordering::Acquire)
    }

    pub fn set_llm_finished(&self, value: bool) {
        self.llm_finish_task.store(value, Ordering::Release);
    }

    /// Mint the id for a new assistant turn. Set exactly once per turn and
    /// referenced by every TTS chunk of that turn.
    pub fn mint_sentence_id(&self) -> String {
        let id = Uuid::new_v4().simple().to_string();
        *self.sentence_id.lock() = Some(id.clone());
        id
    }

    pub fn sentence_id(&self) -> Option<String> {
        self.sentence_id.lock().clone()
    }

    /// Current turn id, minting one if no turn is open yet.
    pub fn sentence_id_or_mint(&self) -> String {
        let mut slot = self.sentence_id.lock();
        match &*slot {
            Some(id) => id.clone(),
            None => {
                let id = Uuid::new_v4().simple().to_string();
                *slot = Some(id.clone());
                id
            }
        }
    }

    pub fn set_tts_message_text(&self, text: impl Into<String>) {
        *self.tts_message_text.lock() = text.into();
    }

    pub fn tts_message_text(&self) -> String {
        self.tts_message_text.lock().clone()
    }

    pub fn set_current_speaker(&self, speaker: Option<String>) {
        *self.current_speaker.lock() = speaker;
    }

    pub fn current_speaker(&self) -> Option<String> {
        self.current_speaker.lock().clone()
    }

    // --- binding ---

    pub fn need_bind(&self) -> bool {
        self.need_bind.load(Ordering::Relaxed)
    }

    pub fn set_need_bind(&self, value: bool) {
        self.need_bind.store(value, Ordering::Relaxed);
    }

    pub fn bind_code(&self) -> Option<String> {
        self.bind_code.lock().clone()
    }

    pub fn set_bind_code(&self, code: Option<String>) {
        *self.bind_code.lock() = code;
    }

    // --- device features ---

    pub fn set_features(&self, features: Value) {
        *self.features.lock() = Some(features);
    }

    pub fn supports_mcp(&self) -> bool {
        self.features
            .lock()
            .as_ref()
            .and_then(|f| f.get("mcp"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .field("device_id", &self.device_id)
            .field("listen_mode", &*self.listen_mode.read())
            .field("is_speaking", &self.is_speaking())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Arc<SessionContext> {
        SessionContext::new("s1", None, None, None, false, GatewayConfig::default())
    }

    #[test]
    fn sentence_ids_are_distinct_per_turn() {
        let ctx = context();
        let a = ctx.mint_sentence_id();
        let b = ctx.mint_sentence_id();
        assert_ne!(a, b);
        assert_eq!(ctx.sentence_id(), Some(b));
    }

    #[test]
    fn sentence_id_or_mint_is_stable_within_turn() {
        let ctx = context();
        let a = ctx.sentence_id_or_mint();
        let b = ctx.sentence_id_or_mint();
        assert_eq!(a, b);
    }

    #[test]
    fn touch_advances_activity() {
        let ctx = context();
        let before = ctx.last_activity_ms();
        std::thread::sleep(std::time::Duration::from_millis(2));
        ctx.touch();
        assert!(ctx.last_activity_ms() >= before);
    }

    #[test]
    fn config_copies_do_not_alias() {
        let ctx_a = context();
        let ctx_b = context();
        let mut cfg = GatewayConfig::default();
        cfg.dialogue.prompt = "changed".to_string();
        ctx_a.set_config(cfg);
        assert_eq!(ctx_b.config().dialogue.prompt, "");
    }

    #[test]
    fn mcp_feature_detection() {
        let ctx = context();
        assert!(!ctx.supports_mcp());
        ctx.set_features(serde_json::json!({ "mcp": true }));
        assert!(ctx.supports_mcp());
    }

    #[test]
    fn timeout_adds_sixty_seconds() {
        let ctx = context();
        assert_eq!(ctx.timeout_seconds(), 120 + 60);
    }
}
