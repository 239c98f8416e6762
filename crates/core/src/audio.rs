//! Audio negotiation types

use serde::{Deserialize, Serialize};

/// Codec of client audio frames, negotiated in `hello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Opus,
    Pcm,
}

impl AudioFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "opus" => Some(AudioFormat::Opus),
            "pcm" => Some(AudioFormat::Pcm),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Opus => "opus",
            AudioFormat::Pcm => "pcm",
        }
    }
}

/// How the device drives utterance boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    /// Server-side VAD decides start and stop.
    #[default]
    Auto,
    /// Push-to-talk: `listen` control frames decide, VAD is bypassed.
    Manual,
    /// Continuous conversation; VAD decides, barge-in allowed.
    Realtime,
}

impl ListenMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(ListenMode::Auto),
            "manual" => Some(ListenMode::Manual),
            "realtime" => Some(ListenMode::Realtime),
            _ => None,
        }
    }
}
