//! Typed configuration tree

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::manager_api::ManagerApiConfig;
use crate::ConfigError;

/// Top-level gateway configuration.
///
/// Every session gets its own deep copy of this tree, optionally overlaid
/// with a remote device profile. Unknown keys land in `extra` and are kept
/// across merges so `get_path` can serve them to the reload path.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub vad: VadConfig,

    #[serde(default)]
    pub stt: SttConfig,

    #[serde(default)]
    pub tts: TtsConfig,

    #[serde(default)]
    pub dialogue: DialogueConfig,

    #[serde(default)]
    pub intent: IntentConfig,

    #[serde(default)]
    pub manager_api: ManagerApiConfig,

    #[serde(default)]
    pub assets: AssetsConfig,

    /// Keys this build does not model. Preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl GatewayConfig {
    /// Whether per-device profiles are fetched from the registry API.
    pub fn read_config_from_api(&self) -> bool {
        !self.manager_api.url.is_empty()
    }

    /// Dotted-path lookup over the serialized tree, including `extra`.
    ///
    /// Only used on the remote-reload path, which must accept keys the typed
    /// tree does not know; typed accessors are the normal route.
    pub fn get_path(&self, path: &str) -> Option<Value> {
        let root = serde_json::to_value(self).ok()?;
        let mut node = &root;
        for part in path.split('.') {
            node = node.as_object()?.get(part)?;
        }
        Some(node.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_ip")]
    pub ip: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Secret for HMAC connection tokens. Empty disables HMAC verification.
    #[serde(default)]
    pub auth_key: String,

    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: default_bind_ip(),
            port: default_port(),
            auth_key: String::new(),
            auth: AuthConfig::default(),
        }
    }
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Static bearer tokens accepted as-is.
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,

    /// Device ids that bypass token checks entirely.
    #[serde(default)]
    pub allowed_devices: Vec<String>,

    /// HMAC token lifetime. `None` falls back to thirty days.
    #[serde(default)]
    pub expire_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    #[serde(default)]
    pub name: String,
}

/// Broker (MQTT-style) transport listener plus its UDP audio endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_broker_bind")]
    pub bind: String,

    #[serde(default = "default_udp_bind")]
    pub udp_bind: String,

    /// Address advertised to devices in the `hello` reply.
    #[serde(default)]
    pub public_ip: String,

    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_broker_bind(),
            udp_bind: default_udp_bind(),
            public_ip: String::new(),
            udp_port: default_udp_port(),
        }
    }
}

fn default_broker_bind() -> String {
    "0.0.0.0:1883".to_string()
}

fn default_udp_bind() -> String {
    "0.0.0.0:8884".to_string()
}

fn default_udp_port() -> u16 {
    8884
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// Score at or above which a chunk is voice.
    #[serde(default = "default_vad_threshold")]
    pub threshold: f32,

    /// Score at or below which a chunk is silence; between the two the
    /// previous classification carries over.
    #[serde(default = "default_vad_threshold_low")]
    pub threshold_low: f32,

    /// Silence after voice that ends an utterance.
    #[serde(default = "default_min_silence_ms")]
    pub min_silence_duration_ms: u64,

    /// Voice chunks required inside the five-chunk window.
    #[serde(default = "default_frame_window_threshold")]
    pub frame_window_threshold: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: default_vad_threshold(),
            threshold_low: default_vad_threshold_low(),
            min_silence_duration_ms: default_min_silence_ms(),
            frame_window_threshold: default_frame_window_threshold(),
        }
    }
}

fn default_vad_threshold() -> f32 {
    0.5
}

fn default_vad_threshold_low() -> f32 {
    0.2
}

fn default_min_silence_ms() -> u64 {
    1000
}

fn default_frame_window_threshold() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    /// Shared-pool queue capacity for local inference.
    #[serde(default = "default_queue_max_size")]
    pub queue_max_size: usize,

    /// Minimum buffered packets before an utterance is worth recognizing.
    #[serde(default = "default_min_packets")]
    pub min_utterance_packets: usize,

    /// Whether the configured engine runs in-process (shared pool) or as a
    /// per-session remote stream.
    #[serde(default)]
    pub local: bool,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            queue_max_size: default_queue_max_size(),
            min_utterance_packets: default_min_packets(),
            local: false,
        }
    }
}

fn default_queue_max_size() -> usize {
    100
}

fn default_min_packets() -> usize {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_frame_duration_ms")]
    pub frame_duration_ms: u64,

    #[serde(default = "default_pre_buffer_frames")]
    pub pre_buffer_frames: usize,

    /// Positive values override the derived schedule with a fixed per-frame
    /// sleep.
    #[serde(default)]
    pub tts_audio_send_delay_ms: i64,

    #[serde(default)]
    pub enable_stop_tts_notify: bool,

    #[serde(default = "default_stop_notify_voice")]
    pub stop_tts_notify_voice: PathBuf,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            frame_duration_ms: default_frame_duration_ms(),
            pre_buffer_frames: default_pre_buffer_frames(),
            tts_audio_send_delay_ms: 0,
            enable_stop_tts_notify: false,
            stop_tts_notify_voice: default_stop_notify_voice(),
        }
    }
}

fn default_frame_duration_ms() -> u64 {
    60
}

fn default_pre_buffer_frames() -> usize {
    5
}

fn default_stop_notify_voice() -> PathBuf {
    PathBuf::from("config/assets/tts_notify.wav")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueConfig {
    /// System prompt used to (re)build the dialogue's system message.
    #[serde(default)]
    pub prompt: String,

    /// Daily per-device assistant-text budget. Zero disables the cap.
    #[serde(default)]
    pub max_output_size: usize,

    #[serde(default)]
    pub exit_commands: Vec<String>,

    #[serde(default)]
    pub wakeup_words: Vec<String>,

    #[serde(default = "default_true")]
    pub enable_greeting: bool,

    #[serde(default)]
    pub greeting: String,

    #[serde(default)]
    pub enable_wakeup_words_response_cache: bool,

    #[serde(default = "default_wakeup_cache_dir")]
    pub wakeup_cache_dir: PathBuf,

    /// Idle seconds before the farewell flow; the hard close fires sixty
    /// seconds later.
    #[serde(default = "default_no_voice_time")]
    pub close_connection_no_voice_time: u64,

    #[serde(default)]
    pub end_prompt: EndPromptConfig,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            max_output_size: 0,
            exit_commands: Vec::new(),
            wakeup_words: Vec::new(),
            enable_greeting: true,
            greeting: String::new(),
            enable_wakeup_words_response_cache: false,
            wakeup_cache_dir: default_wakeup_cache_dir(),
            close_connection_no_voice_time: default_no_voice_time(),
            end_prompt: EndPromptConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_wakeup_cache_dir() -> PathBuf {
    PathBuf::from("data/wakeup_cache")
}

fn default_no_voice_time() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndPromptConfig {
    #[serde(default = "default_true")]
    pub enable: bool,

    #[serde(default)]
    pub prompt: String,
}

impl Default for EndPromptConfig {
    fn default() -> Self {
        Self {
            enable: true,
            prompt: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IntentMode {
    /// No pre-dialogue classification; only exit commands and wake words.
    #[default]
    Nointent,
    /// The dialogue LLM decides tool use itself.
    FunctionCall,
    /// A cheap classifier LLM runs before the dialogue LLM.
    IntentLlm,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IntentConfig {
    #[serde(default)]
    pub mode: IntentMode,
}

/// Pre-recorded clips played by the policy paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetsConfig {
    #[serde(default = "default_bind_code_clip")]
    pub bind_code_clip: PathBuf,

    /// Directory with `0.wav` .. `9.wav` digit clips.
    #[serde(default = "default_bind_digits_dir")]
    pub bind_digits_dir: PathBuf,

    #[serde(default = "default_bind_not_found_clip")]
    pub bind_not_found_clip: PathBuf,

    #[serde(default = "default_max_output_clip")]
    pub max_output_clip: PathBuf,

    #[serde(default = "default_wakeup_clip")]
    pub wakeup_fallback_clip: PathBuf,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            bind_code_clip: default_bind_code_clip(),
            bind_digits_dir: default_bind_digits_dir(),
            bind_not_found_clip: default_bind_not_found_clip(),
            max_output_clip: default_max_output_clip(),
            wakeup_fallback_clip: default_wakeup_clip(),
        }
    }
}

fn default_bind_code_clip() -> PathBuf {
    PathBuf::from("config/assets/bind_code.wav")
}

fn default_bind_digits_dir() -> PathBuf {
    PathBuf::from("config/assets/bind_code")
}

fn default_bind_not_found_clip() -> PathBuf {
    PathBuf::from("config/assets/bind_not_found.wav")
}

fn default_max_output_clip() -> PathBuf {
    PathBuf::from("config/assets/max_output_size.wav")
}

fn default_wakeup_clip() -> PathBuf {
    PathBuf::from("config/assets/wakeup_words_short.wav")
}

/// Load the configuration, layering an optional YAML file under
/// `VOICE_GATEWAY_`-prefixed environment variables.
pub fn load_config(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        builder = builder.add_source(File::from(path));
    }
    let raw = builder
        .add_source(Environment::with_prefix("VOICE_GATEWAY").separator("__"))
        .build()?;

    let cfg: GatewayConfig = raw.try_deserialize()?;
    if cfg.vad.threshold < cfg.vad.threshold_low {
        return Err(ConfigError::Invalid(
            "vad.threshold must be >= vad.threshold_low".to_string(),
        ));
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.tts.frame_duration_ms, 60);
        assert_eq!(cfg.tts.pre_buffer_frames, 5);
        assert_eq!(cfg.vad.min_silence_duration_ms, 1000);
        assert_eq!(cfg.stt.queue_max_size, 100);
        assert!(!cfg.read_config_from_api());
    }

    #[test]
    fn get_path_reaches_typed_and_extra_keys() {
        let mut cfg = GatewayConfig::default();
        cfg.extra.insert(
            "plugins".to_string(),
            serde_json::json!({ "weather": { "api_key": "k" } }),
        );

        assert_eq!(
            cfg.get_path("vad.threshold").and_then(|v| v.as_f64()),
            Some(0.5)
        );
        assert_eq!(
            cfg.get_path("plugins.weather.api_key")
                .and_then(|v| v.as_str().map(String::from))
                .as_deref(),
            Some("k")
        );
        assert!(cfg.get_path("no.such.key").is_none());
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "tts:\n  frame_duration_ms: 20\ndialogue:\n  exit_commands: [\"再见\"]"
        )
        .unwrap();

        let cfg = load_config(Some(file.path())).unwrap();
        assert_eq!(cfg.tts.frame_duration_ms, 20);
        assert_eq!(cfg.dialogue.exit_commands, vec!["再见".to_string()]);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.tts.pre_buffer_frames, 5);
    }

    #[test]
    fn rejects_inverted_vad_thresholds() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "vad:\n  threshold: 0.1\n  threshold_low: 0.4").unwrap();
        assert!(load_config(Some(file.path())).is_err());
    }
}
