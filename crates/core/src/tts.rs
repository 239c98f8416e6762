//! TTS queue message types
//!
//! A turn travels through the orchestrator as a FIRST/…/LAST bracketed run
//! of messages: ACTION entries are boundary markers with no audio, TEXT
//! entries need synthesis, FILE entries reference a pre-recorded clip.

use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentenceType {
    First,
    Middle,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Text,
    File,
    Action,
}

/// One entry of the per-session text queue.
#[derive(Debug, Clone)]
pub struct TtsMessage {
    /// Turn this entry belongs to.
    pub sentence_id: String,
    pub sentence_type: SentenceType,
    pub content_type: ContentType,
    pub text: Option<String>,
    pub file: Option<PathBuf>,
}

impl TtsMessage {
    pub fn action(sentence_id: impl Into<String>, sentence_type: SentenceType) -> Self {
        Self {
            sentence_id: sentence_id.into(),
            sentence_type,
            content_type: ContentType::Action,
            text: None,
            file: None,
        }
    }

    pub fn text(sentence_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sentence_id: sentence_id.into(),
            sentence_type: SentenceType::Middle,
            content_type: ContentType::Text,
            text: Some(text.into()),
            file: None,
        }
    }

    pub fn file(sentence_id: impl Into<String>, path: PathBuf) -> Self {
        Self {
            sentence_id: sentence_id.into(),
            sentence_type: SentenceType::Middle,
            content_type: ContentType::File,
            text: None,
            file: Some(path),
        }
    }
}

/// One entry of the per-session audio queue, drained by the paced sender.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub sentence_id: String,
    pub boundary: SentenceType,
    /// Encoded frames, one wire frame each. Empty for pure boundaries.
    pub frames: Vec<Vec<u8>>,
    /// Caption sent with `sentence_start`.
    pub caption: Option<String>,
}

impl AudioChunk {
    pub fn boundary(sentence_id: impl Into<String>, boundary: SentenceType) -> Self {
        Self {
            sentence_id: sentence_id.into(),
            boundary,
            frames: Vec::new(),
            caption: None,
        }
    }
}
