//! Dialogue policy and per-session services
//!
//! The services in this crate subscribe to the event bus and drive the
//! pipeline: audio frames through VAD and recognition, final transcripts
//! through the intent gate into the dialogue LLM, tool calls through the
//! dispatcher, and synthesized turns back out via the TTS orchestrator.

pub mod abort;
pub mod audio;
pub mod calendar;
pub mod counter;
pub mod dialogue;
pub mod intent;
pub mod wakeup;

pub use abort::AbortService;
pub use audio::AudioService;
pub use counter::OutputCounter;
pub use dialogue::DialogueService;
pub use intent::IntentService;
pub use wakeup::WakeupCache;

/// Container service names shared by the wiring and the services.
pub mod service_names {
    pub const SESSION_CONTEXT: &str = "session_context";
    pub const TRANSPORT: &str = "transport";
    pub const VAD: &str = "vad";
    pub const ASR_ADAPTER: &str = "asr_adapter";
    pub const MCP_CLIENT: &str = "mcp_client";
}
