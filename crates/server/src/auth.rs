//! Connection authentication
//!
//! Three mechanisms, OR-combined: a device allow-list, static bearer
//! tokens, and HMAC-signed connection tokens of the form
//! `base64url(HMAC-SHA256(secret, "client_id|device_id|ts")).ts`.
//! The token carries no plaintext identity, only the signature and the
//! timestamp; identity travels in the connection headers (WebSocket) or the
//! CONNECT credentials (broker). Disabled auth passes unconditionally.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use voice_gateway_config::GatewayConfig;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_EXPIRE_SECONDS: u64 = 60 * 60 * 24 * 30;

/// Generates and verifies the HMAC connection tokens.
pub struct AuthManager {
    secret: String,
    expire_seconds: u64,
}

impl AuthManager {
    pub fn new(secret: impl Into<String>, expire_seconds: Option<u64>) -> Self {
        Self {
            secret: secret.into(),
            expire_seconds: match expire_seconds {
                Some(0) | None => DEFAULT_EXPIRE_SECONDS,
                Some(s) => s,
            },
        }
    }

    fn mac(&self, content: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(content.as_bytes());
        mac
    }

    fn sign(&self, content: &str) -> String {
        URL_SAFE_NO_PAD.encode(self.mac(content).finalize().into_bytes())
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Mint a token for a `(client_id, device_id)` pair.
    pub fn generate_token(&self, client_id: &str, device_id: &str) -> String {
        let ts = Self::now();
        let signature = self.sign(&format!("{client_id}|{device_id}|{ts}"));
        format!("{signature}.{ts}")
    }

    /// Verify by recomputation; the comparison is constant-time.
    pub fn verify_token(&self, token: &str, client_id: &str, device_id: &str) -> bool {
        let Some((signature, ts_str)) = token.rsplit_once('.') else {
            return false;
        };
        let Ok(ts) = ts_str.parse::<u64>() else {
            return false;
        };
        if Self::now().saturating_sub(ts) > self.expire_seconds {
            return false;
        }
        let Ok(raw_signature) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        self.mac(&format!("{client_id}|{device_id}|{ts}"))
            .verify_slice(&raw_signature)
            .is_ok()
    }
}

/// Connection-level gate combining every configured mechanism.
pub struct AuthGate {
    enabled: bool,
    tokens: HashSet<String>,
    allowed_devices: HashSet<String>,
    manager: Option<AuthManager>,
}

impl AuthGate {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let auth = &config.server.auth;
        let manager = if config.server.auth_key.is_empty() {
            None
        } else {
            Some(AuthManager::new(
                config.server.auth_key.clone(),
                auth.expire_seconds,
            ))
        };
        Self {
            enabled: auth.enabled,
            tokens: auth.tokens.iter().map(|t| t.token.clone()).collect(),
            allowed_devices: auth.allowed_devices.iter().cloned().collect(),
            manager,
        }
    }

    /// `authorization` may carry a `Bearer ` prefix.
    pub fn authenticate(
        &self,
        device_id: Option<&str>,
        client_id: Option<&str>,
        authorization: Option<&str>,
    ) -> bool {
        if !self.enabled {
            return true;
        }

        if let Some(device_id) = device_id {
            if self.allowed_devices.contains(device_id) {
                return true;
            }
        }

        let token = authorization.map(|a| a.strip_prefix("Bearer ").unwrap_or(a));
        let Some(token) = token else {
            return false;
        };
        if self.tokens.contains(token) {
            return true;
        }

        if let (Some(manager), Some(client_id), Some(device_id)) =
            (self.manager.as_ref(), client_id, device_id)
        {
            return manager.verify_token(token, client_id, device_id);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voice_gateway_config::TokenEntry;

    #[test]
    fn token_round_trip() {
        let manager = AuthManager::new("secret", None);
        let token = manager.generate_token("client-1", "aa:bb");
        assert!(manager.verify_token(&token, "client-1", "aa:bb"));
    }

    #[test]
    fn tampering_breaks_verification() {
        let manager = AuthManager::new("secret", None);
        let token = manager.generate_token("client-1", "aa:bb");

        // Flip one signature character.
        let mut tampered: Vec<char> = token.chars().collect();
        tampered[0] = if tampered[0] == 'A' { 'B' } else { 'A' };
        let tampered: String = tampered.into_iter().collect();
        assert!(!manager.verify_token(&tampered, "client-1", "aa:bb"));

        // Wrong identity.
        assert!(!manager.verify_token(&token, "client-2", "aa:bb"));
        assert!(!manager.verify_token(&token, "client-1", "aa:cc"));

        // Tampered timestamp.
        let (sig, _) = token.rsplit_once('.').unwrap();
        assert!(!manager.verify_token(&format!("{sig}.123"), "client-1", "aa:bb"));
    }

    #[test]
    fn expired_token_is_rejected() {
        let manager = AuthManager::new("secret", Some(10));
        let ts = AuthManager::now() - 3600;
        let signature = manager.sign(&format!("client-1|aa:bb|{ts}"));
        assert!(!manager.verify_token(&format!("{signature}.{ts}"), "client-1", "aa:bb"));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let manager = AuthManager::new("secret", None);
        for bad in ["", "no-dot", "sig.not-a-number", ".123"] {
            assert!(!manager.verify_token(bad, "c", "d"), "accepted {bad:?}");
        }
    }

    fn gate(enabled: bool) -> AuthGate {
        let mut config = GatewayConfig::default();
        config.server.auth.enabled = enabled;
        config.server.auth_key = "topsecret".to_string();
        config.server.auth.tokens = vec![TokenEntry {
            token: "static-token".to_string(),
            name: "test".to_string(),
        }];
        config.server.auth.allowed_devices = vec!["ff:ff:ff:ff:ff:ff".to_string()];
        AuthGate::from_config(&config)
    }

    #[test]
    fn disabled_auth_passes_everything() {
        assert!(gate(false).authenticate(None, None, None));
    }

    #[test]
    fn allow_list_bypasses_tokens() {
        let gate = gate(true);
        assert!(gate.authenticate(Some("ff:ff:ff:ff:ff:ff"), None, None));
        assert!(!gate.authenticate(Some("11:22:33:44:55:66"), None, None));
    }

    #[test]
    fn static_token_with_and_without_bearer_prefix() {
        let gate = gate(true);
        assert!(gate.authenticate(Some("x"), None, Some("Bearer static-token")));
        assert!(gate.authenticate(Some("x"), None, Some("static-token")));
        assert!(!gate.authenticate(Some("x"), None, Some("Bearer wrong")));
    }

    #[test]
    fn hmac_token_through_the_gate() {
        let gate = gate(true);
        let manager = AuthManager::new("topsecret", None);
        let token = manager.generate_token("client-1", "aa:bb");
        assert!(gate.authenticate(
            Some("aa:bb"),
            Some("client-1"),
            Some(&format!("Bearer {token}"))
        ));
        assert!(!gate.authenticate(Some("aa:bb"), Some("other"), Some(&token)));
    }
}
