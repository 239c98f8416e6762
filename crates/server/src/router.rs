//! Message router
//!
//! Parses each inbound frame and publishes exactly one event, or handles
//! the frame in place for the message kinds that produce none. Text frames
//! update the activity clock; raw audio does not, the VAD is the authority
//! on voice activity.

use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

use voice_gateway_config::{load_config, GatewayConfig};
use voice_gateway_core::events::AbortReason;
use voice_gateway_core::{
    AudioFormat, Container, Event, EventBus, EventPayload, ListenMode, SessionContext,
};
use voice_gateway_tools::McpClient;
use voice_gateway_transport::{AudioHeader, Frame, Transport};

use voice_gateway_agent::service_names;

pub struct MessageRouter {
    container: Arc<Container>,
    bus: Arc<EventBus>,
    /// Server defaults, shared with the HTTP layer; replaced on a
    /// privileged `update_config`.
    defaults: Arc<RwLock<GatewayConfig>>,
    config_path: Option<PathBuf>,
}

impl MessageRouter {
    pub fn new(
        container: Arc<Container>,
        bus: Arc<EventBus>,
        defaults: Arc<RwLock<GatewayConfig>>,
        config_path: Option<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            container,
            bus,
            defaults,
            config_path,
        })
    }

    pub async fn route_frame(
        &self,
        ctx: &Arc<SessionContext>,
        transport: &Arc<dyn Transport>,
        frame: Frame,
    ) {
        match frame {
            Frame::Binary(data) => self.route_audio(ctx, data).await,
            Frame::Text(text) => {
                ctx.touch();
                self.route_text(ctx, transport, text).await;
            }
        }
    }

    async fn route_audio(&self, ctx: &Arc<SessionContext>, data: Bytes) {
        // Gateway-framed connections prefix every binary frame with the
        // 16-byte header; strip it before the pipeline sees the audio.
        let payload = if ctx.from_gateway && data.len() >= 16 {
            match AudioHeader::split_frame(&data) {
                Ok((_, audio)) => Bytes::copy_from_slice(audio),
                Err(_) => data,
            }
        } else {
            data
        };
        self.bus
            .publish(Event::new(
                ctx.session_id.clone(),
                EventPayload::AudioDataReceived { data: payload },
            ))
            .await;
    }

    async fn route_text(
        &self,
        ctx: &Arc<SessionContext>,
        transport: &Arc<dyn Transport>,
        text: String,
    ) {
        let Ok(message) = serde_json::from_str::<Value>(&text) else {
            // Unstructured text is treated as a finished utterance.
            self.bus
                .publish(Event::new(
                    ctx.session_id.clone(),
                    EventPayload::TranscriptReady {
                        text,
                        is_final: true,
                        confidence: None,
                    },
                ))
                .await;
            return;
        };

        match message.get("type").and_then(Value::as_str) {
            Some("hello") => self.handle_hello(ctx, transport, &message).await,
            Some("listen") => self.handle_listen(ctx, &message).await,
            Some("abort") => {
                self.bus
                    .publish(Event::new(
                        ctx.session_id.clone(),
                        EventPayload::ClientAbort {
                            reason: AbortReason::ClientRequest,
                        },
                    ))
                    .await;
            }
            Some("iot") => self.handle_iot(ctx, &message),
            Some("mcp") => self.handle_mcp(ctx, &message),
            Some("server") => self.handle_server(ctx, transport, &message).await,
            other => {
                tracing::warn!(
                    session_id = %ctx.session_id,
                    message_type = other.unwrap_or("<none>"),
                    "unknown control message dropped"
                );
            }
        }
    }

    /// Negotiate audio parameters and device features, then reply with the
    /// welcome message.
    async fn handle_hello(
        &self,
        ctx: &Arc<SessionContext>,
        transport: &Arc<dyn Transport>,
        message: &Value,
    ) {
        if let Some(format) = message
            .pointer("/audio_params/format")
            .and_then(Value::as_str)
        {
            match AudioFormat::parse(format) {
                Some(format) => ctx.set_audio_format(format),
                None => tracing::warn!(format, "unsupported audio format requested"),
            }
        }

        if let Some(features) = message.get("features") {
            ctx.set_features(features.clone());
            if ctx.supports_mcp() {
                let client = Arc::new(McpClient::new(transport.clone()));
                self.container.register_session_value(
                    &ctx.session_id,
                    service_names::MCP_CLIENT,
                    client.clone(),
                );
                tokio::spawn(async move {
                    if let Err(err) = client.initialize().await {
                        tracing::warn!(error = %err, "device mcp initialization failed");
                    }
                });
            }
        }

        let mut welcome = json!({
            "type": "hello",
            "transport": "websocket",
            "session_id": ctx.session_id,
            "audio_params": {
                "format": ctx.audio_format().as_str(),
                "sample_rate": 16000,
            },
        });
        // The broker variant attaches its datagram endpoint and key here.
        if let Some(extension) = transport.hello_extension() {
            if let (Value::Object(welcome_map), Value::Object(ext)) = (&mut welcome, extension) {
                welcome_map.insert("transport".to_string(), Value::String("udp".to_string()));
                welcome_map.insert("udp".to_string(), Value::Object(ext));
            }
        }
        if let Err(err) = transport.send_json(&welcome).await {
            tracing::warn!(session_id = %ctx.session_id, error = %err, "welcome send failed");
        }

        // Handlers observe connect-time data through the ordinary event.
        self.bus
            .publish(Event::new(
                ctx.session_id.clone(),
                EventPayload::TextMessageReceived {
                    content: message.to_string(),
                },
            ))
            .await;
    }

    async fn handle_listen(&self, ctx: &Arc<SessionContext>, message: &Value) {
        if let Some(mode) = message.get("mode").and_then(Value::as_str) {
            match ListenMode::parse(mode) {
                Some(mode) => {
                    ctx.set_listen_mode(mode);
                    tracing::debug!(session_id = %ctx.session_id, ?mode, "listen mode set");
                }
                None => tracing::warn!(mode, "unknown listen mode ignored"),
            }
        }

        match message.get("state").and_then(Value::as_str) {
            Some("start") => {
                ctx.set_have_voice(true);
                ctx.set_voice_stopped(false);
            }
            Some("stop") => {
                ctx.set_have_voice(true);
                ctx.set_voice_stopped(true);
                // Flush whatever is buffered through the normal audio path.
                self.bus
                    .publish(Event::new(
                        ctx.session_id.clone(),
                        EventPayload::AudioDataReceived { data: Bytes::new() },
                    ))
                    .await;
            }
            Some("detect") => {
                ctx.set_have_voice(false);
                if let Ok(asr) = self
                    .container
                    .resolve_typed::<voice_gateway_pipeline::AsrAdapter>(
                        service_names::ASR_ADAPTER,
                        Some(&ctx.session_id),
                    )
                {
                    asr.clear();
                }
                if let Some(text) = message.get("text").and_then(Value::as_str) {
                    ctx.touch();
                    self.bus
                        .publish(Event::new(
                            ctx.session_id.clone(),
                            EventPayload::TranscriptReady {
                                text: text.to_string(),
                                is_final: true,
                                confidence: None,
                            },
                        ))
                        .await;
                }
            }
            other => tracing::debug!(state = ?other, "listen state ignored"),
        }
    }

    /// Device capability advertisement; no event is published.
    fn handle_iot(&self, ctx: &Arc<SessionContext>, message: &Value) {
        let mut descriptors = ctx.iot_descriptors.lock();
        if let Some(Value::Array(list)) = message.get("descriptors") {
            for descriptor in list {
                if let Some(name) = descriptor.get("name").and_then(Value::as_str) {
                    descriptors.insert(name.to_string(), descriptor.clone());
                }
            }
        }
        if let Some(states) = message.get("states") {
            descriptors.insert("states".to_string(), states.clone());
        }
    }

    fn handle_mcp(&self, ctx: &Arc<SessionContext>, message: &Value) {
        let Some(payload) = message.get("payload") else {
            tracing::debug!("mcp frame without payload");
            return;
        };
        match self
            .container
            .resolve_typed::<McpClient>(service_names::MCP_CLIENT, Some(&ctx.session_id))
        {
            Ok(client) => client.handle_payload(payload),
            Err(_) => {
                tracing::debug!(session_id = %ctx.session_id, "mcp frame but no client negotiated")
            }
        }
    }

    /// Privileged config reload / restart, secret-checked. The contract is
    /// the same on both transport variants.
    async fn handle_server(
        &self,
        ctx: &Arc<SessionContext>,
        transport: &Arc<dyn Transport>,
        message: &Value,
    ) {
        let config = ctx.config();
        if !config.read_config_from_api() {
            return;
        }
        let presented = message
            .pointer("/content/secret")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if presented.is_empty() || presented != config.manager_api.secret {
            self.send_server_response(transport, false, "服务器密钥验证失败")
                .await;
            return;
        }

        match message.get("action").and_then(Value::as_str) {
            Some("update_config") => {
                let reloaded = match self.config_path.as_deref() {
                    Some(path) => load_config(Some(path)),
                    None => load_config(None),
                };
                match reloaded {
                    Ok(new_config) => {
                        *self.defaults.write() = new_config;
                        tracing::info!("server defaults reloaded");
                        self.send_server_response(transport, true, "配置更新成功").await;
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "config reload failed");
                        self.send_server_response(transport, false, "更新服务器配置失败")
                            .await;
                    }
                }
            }
            Some("restart") => {
                tracing::warn!(session_id = %ctx.session_id, "restart requested by manager");
                self.send_server_response(transport, true, "服务器重启中").await;
                self.bus
                    .publish(Event::new(
                        ctx.session_id.clone(),
                        EventPayload::SessionDestroying,
                    ))
                    .await;
            }
            other => {
                self.send_server_response(
                    transport,
                    false,
                    &format!("未知的服务器操作: {}", other.unwrap_or("<none>")),
                )
                .await;
            }
        }
    }

    async fn send_server_response(
        &self,
        transport: &Arc<dyn Transport>,
        ok: bool,
        message: &str,
    ) {
        let response = json!({
            "type": "server",
            "status": if ok { "success" } else { "error" },
            "message": message,
        });
        let _ = transport.send_json(&response).await;
    }
}
