//! Core runtime for the voice gateway
//!
//! This crate provides the coordination substrate every other crate builds
//! on:
//! - typed session events and the publish/subscribe bus
//! - the service container (global / per-session / transient scopes)
//! - the per-session lifecycle manager with ordered start/stop hooks
//! - the session context and dialogue history
//! - TTS message and boundary types

pub mod audio;
pub mod bus;
pub mod container;
pub mod dialogue;
pub mod events;
pub mod lifecycle;
pub mod session;
pub mod text;
pub mod tts;

pub use audio::{AudioFormat, ListenMode};
pub use bus::EventBus;
pub use container::{Container, ContainerError, Scope};
pub use dialogue::{Dialogue, DialogueMessage, Role};
pub use events::{now_ms, Event, EventKind, EventPayload};
pub use lifecycle::{LifecycleManager, LifecycleState};
pub use session::{SessionContext, SessionId};
pub use tts::{AudioChunk, ContentType, SentenceType, TtsMessage};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("lifecycle hook failed: {0}")]
    Lifecycle(String),

    #[error("session {0} not found")]
    SessionNotFound(String),
}
