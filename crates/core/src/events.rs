//! Session events
//!
//! Plain data carriers published on the [`EventBus`](crate::bus::EventBus).
//! Every event names its session and carries a monotonic timestamp taken at
//! publish-construction time.

use bytes::Bytes;
use once_cell::sync::Lazy;
use std::time::Instant;

use crate::session::SessionId;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds on the process-monotonic clock.
pub fn now_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

#[derive(Debug, Clone)]
pub struct Event {
    pub session_id: SessionId,
    pub timestamp_ms: u64,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(session_id: impl Into<SessionId>, payload: EventPayload) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp_ms: now_ms(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    SessionCreated {
        device_id: Option<String>,
        client_ip: Option<String>,
    },
    SessionDestroying,
    TextMessageReceived {
        content: String,
    },
    AudioDataReceived {
        data: Bytes,
    },
    VadSpeechStart,
    VadSpeechEnd,
    TranscriptReady {
        text: String,
        is_final: bool,
        confidence: Option<f32>,
    },
    LlmRequest {
        text: String,
    },
    LlmResponse {
        text: String,
    },
    LlmError {
        message: String,
    },
    TtsRequest {
        text: String,
    },
    TtsAudioReady {
        sentence_id: String,
    },
    TtsError {
        message: String,
    },
    IntentRecognized {
        intent: String,
        arguments: serde_json::Value,
    },
    ToolCallRequest {
        tool_name: String,
        tool_call_id: String,
        arguments: serde_json::Value,
    },
    ToolCallResponse {
        tool_call_id: String,
        ok: bool,
    },
    ClientAbort {
        reason: AbortReason,
    },
    ClientSpeakingState {
        speaking: bool,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    ClientRequest,
    UserInterrupt,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::ClientRequest => "client_request",
            AbortReason::UserInterrupt => "user_interrupt",
        }
    }
}

/// Discriminant used for handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionCreated,
    SessionDestroying,
    TextMessageReceived,
    AudioDataReceived,
    VadSpeechStart,
    VadSpeechEnd,
    TranscriptReady,
    LlmRequest,
    LlmResponse,
    LlmError,
    TtsRequest,
    TtsAudioReady,
    TtsError,
    IntentRecognized,
    ToolCallRequest,
    ToolCallResponse,
    ClientAbort,
    ClientSpeakingState,
    Error,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::SessionCreated { .. } => EventKind::SessionCreated,
            EventPayload::SessionDestroying => EventKind::SessionDestroying,
            EventPayload::TextMessageReceived { .. } => EventKind::TextMessageReceived,
            EventPayload::AudioDataReceived { .. } => EventKind::AudioDataReceived,
            EventPayload::VadSpeechStart => EventKind::VadSpeechStart,
            EventPayload::VadSpeechEnd => EventKind::VadSpeechEnd,
            EventPayload::TranscriptReady { .. } => EventKind::TranscriptReady,
            EventPayload::LlmRequest { .. } => EventKind::LlmRequest,
            EventPayload::LlmResponse { .. } => EventKind::LlmResponse,
            EventPayload::LlmError { .. } => EventKind::LlmError,
            EventPayload::TtsRequest { .. } => EventKind::TtsRequest,
            EventPayload::TtsAudioReady { .. } => EventKind::TtsAudioReady,
            EventPayload::TtsError { .. } => EventKind::TtsError,
            EventPayload::IntentRecognized { .. } => EventKind::IntentRecognized,
            EventPayload::ToolCallRequest { .. } => EventKind::ToolCallRequest,
            EventPayload::ToolCallResponse { .. } => EventKind::ToolCallResponse,
            EventPayload::ClientAbort { .. } => EventKind::ClientAbort,
            EventPayload::ClientSpeakingState { .. } => EventKind::ClientSpeakingState,
            EventPayload::Error { .. } => EventKind::Error,
        }
    }
}
