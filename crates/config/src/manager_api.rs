//! Device-registry client
//!
//! Fetches the per-device configuration profile that is merged over the
//! server defaults when a session is created. Binding outcomes are typed:
//! an unknown device and a device awaiting binding are expected control-flow
//! results, not generic HTTP failures.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ManagerApiConfig {
    /// Registry base URL. Empty disables remote profiles.
    #[serde(default)]
    pub url: String,

    /// Shared secret, also checked for privileged `server` frames.
    #[serde(default)]
    pub secret: String,
}

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("device not found in registry")]
    DeviceNotFound,

    #[error("device awaiting binding, code {0}")]
    DeviceBind(String),

    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected registry response: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct ProfileEnvelope {
    code: i64,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    msg: Option<String>,
}

const CODE_OK: i64 = 0;
const CODE_DEVICE_NOT_FOUND: i64 = 40401;
const CODE_DEVICE_UNBOUND: i64 = 40402;

pub struct ManagerApiClient {
    config: ManagerApiConfig,
    http: reqwest::Client,
}

impl ManagerApiClient {
    pub fn new(config: ManagerApiConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Fetch the profile overlay for one device.
    ///
    /// `DeviceBind` carries the six-digit code the gateway speaks to the
    /// user; `DeviceNotFound` means the registry has never seen this device.
    pub async fn fetch_device_profile(
        &self,
        device_id: &str,
        client_id: Option<&str>,
    ) -> Result<Value, ProfileError> {
        let url = format!(
            "{}/device/profile",
            self.config.url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "device_id": device_id,
            "client_id": client_id,
        });

        let envelope: ProfileEnvelope = self
            .http
            .post(&url)
            .bearer_auth(&self.config.secret)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        match envelope.code {
            CODE_OK => envelope
                .data
                .ok_or_else(|| ProfileError::Malformed("profile payload missing".to_string())),
            CODE_DEVICE_NOT_FOUND => Err(ProfileError::DeviceNotFound),
            CODE_DEVICE_UNBOUND => {
                let code = envelope
                    .data
                    .as_ref()
                    .and_then(|d| d.get("bind_code"))
                    .and_then(|c| c.as_str())
                    .map(str::to_owned)
                    .ok_or_else(|| {
                        ProfileError::Malformed("bind code missing from response".to_string())
                    })?;
                Err(ProfileError::DeviceBind(code))
            }
            other => Err(ProfileError::Malformed(format!(
                "code {other}: {}",
                envelope.msg.unwrap_or_default()
            ))),
        }
    }
}
