//! Configuration management for the voice gateway
//!
//! Supports loading configuration from:
//! - YAML files
//! - Environment variables (VOICE_GATEWAY_ prefix)
//! - A remote device-registry profile merged per session
//!
//! The tree is typed (`GatewayConfig`); unknown keys survive round-trips via
//! the flattened `extra` map so the remote-reload path can carry keys this
//! build does not know about.

pub mod manager_api;
pub mod merge;
pub mod settings;

pub use manager_api::{ManagerApiClient, ManagerApiConfig, ProfileError};
pub use merge::merge_values;
pub use settings::{
    load_config, AssetsConfig, AuthConfig, BrokerConfig, DialogueConfig, EndPromptConfig,
    GatewayConfig, IntentMode, ServerConfig, SttConfig, TokenEntry, TtsConfig, VadConfig,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Parse(err.to_string())
    }
}
