//! Session management
//!
//! Owns the `session_id → SessionContext` map. Creation deep-copies the
//! server config, overlays the remote device profile when configured, and
//! announces the session on the bus; teardown is driven by the
//! `SessionDestroying` event so every trigger (transport close, exit
//! command, idle timeout, fatal error) funnels through one path.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use voice_gateway_config::{merge_values, GatewayConfig, ManagerApiClient, ProfileError};
use voice_gateway_core::{
    Container, Event, EventBus, EventKind, EventPayload, SessionContext, SessionId,
};

use voice_gateway_agent::service_names;

/// Poll interval of the per-session idle monitor.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

pub struct SessionManager {
    container: Arc<Container>,
    bus: Arc<EventBus>,
    sessions: DashMap<SessionId, Arc<SessionContext>>,
    profile_client: Option<Arc<ManagerApiClient>>,
}

impl SessionManager {
    pub fn new(
        container: Arc<Container>,
        bus: Arc<EventBus>,
        profile_client: Option<Arc<ManagerApiClient>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            container,
            bus,
            sessions: DashMap::new(),
            profile_client,
        })
    }

    /// Subscribe the teardown path to `SessionDestroying`.
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        let manager = self.clone();
        bus.subscribe(EventKind::SessionDestroying, move |event| {
            let manager = manager.clone();
            async move { manager.teardown(&event.session_id).await }
        });
    }

    /// Create a session for an accepted, authenticated connection.
    pub async fn create_session(
        &self,
        defaults: GatewayConfig,
        device_id: Option<String>,
        client_id: Option<String>,
        client_ip: Option<String>,
        from_gateway: bool,
    ) -> Arc<SessionContext> {
        let session_id = Uuid::new_v4().to_string();
        let mut config = defaults;
        let mut need_bind = false;
        let mut bind_code = None;

        if config.read_config_from_api() {
            if let (Some(client), Some(device)) = (self.profile_client.as_ref(), device_id.as_deref())
            {
                match client.fetch_device_profile(device, client_id.as_deref()).await {
                    Ok(profile) => {
                        let mut tree = serde_json::to_value(&config).unwrap_or_default();
                        merge_values(&mut tree, profile);
                        match serde_json::from_value(tree) {
                            Ok(merged) => {
                                config = merged;
                                tracing::info!(%session_id, device, "device profile applied");
                            }
                            Err(err) => {
                                tracing::error!(error = %err, "device profile unusable, using defaults")
                            }
                        }
                    }
                    Err(ProfileError::DeviceNotFound) => {
                        tracing::warn!(%session_id, device, "device not registered");
                        need_bind = true;
                    }
                    Err(ProfileError::DeviceBind(code)) => {
                        tracing::warn!(%session_id, device, %code, "device awaiting binding");
                        need_bind = true;
                        bind_code = Some(code);
                    }
                    Err(err) => {
                        tracing::error!(%session_id, error = %err, "profile fetch failed");
                    }
                }
            }
        }

        let prompt = config.dialogue.prompt.clone();
        let ctx = SessionContext::new(
            session_id.clone(),
            device_id.clone(),
            client_id,
            client_ip.clone(),
            from_gateway,
            config,
        );
        ctx.set_need_bind(need_bind);
        ctx.set_bind_code(bind_code);
        if !prompt.is_empty() {
            ctx.dialogue.lock().update_system_message(prompt);
        }

        self.container.register_session_value(
            &session_id,
            service_names::SESSION_CONTEXT,
            ctx.clone(),
        );
        self.sessions.insert(session_id.clone(), ctx.clone());

        tracing::info!(
            %session_id,
            device_id = device_id.as_deref().unwrap_or("-"),
            client_ip = client_ip.as_deref().unwrap_or("-"),
            from_gateway,
            "session created"
        );
        self.bus
            .publish(Event::new(
                session_id,
                EventPayload::SessionCreated {
                    device_id,
                    client_ip,
                },
            ))
            .await;

        self.spawn_idle_monitor(ctx.clone());
        ctx
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionContext>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Request destruction; actual teardown runs in the event handler.
    pub async fn destroy_session(&self, session_id: &str) {
        self.bus
            .publish(Event::new(
                session_id.to_string(),
                EventPayload::SessionDestroying,
            ))
            .await;
    }

    /// Exactly-once teardown, guarded by removal from the map.
    async fn teardown(&self, session_id: &str) {
        let Some((_, ctx)) = self.sessions.remove(session_id) else {
            return;
        };
        tracing::info!(session_id, "destroying session");
        ctx.lifecycle.stop().await;
        self.container.cleanup_session(session_id);
        tracing::info!(session_id, "session destroyed");
    }

    /// Watches `last_activity_time_ms`. When the idle budget is exceeded it
    /// fires the end-of-chat flow once: with the farewell prompt enabled the
    /// assistant says goodbye and the session closes after that turn,
    /// otherwise the session closes immediately.
    fn spawn_idle_monitor(&self, ctx: Arc<SessionContext>) {
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let mut stop = ctx.lifecycle.stop_signal();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_CHECK_INTERVAL) => {}
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            return;
                        }
                    }
                }
                if ctx.lifecycle.is_stopped() {
                    return;
                }
                if ctx.close_after_chat() {
                    continue;
                }
                let budget_ms = ctx.timeout_seconds() * 1000;
                if ctx.idle_ms() <= budget_ms {
                    continue;
                }

                tracing::info!(
                    session_id = %ctx.session_id,
                    idle_ms = ctx.idle_ms(),
                    "session idle, starting end-of-chat"
                );
                ctx.set_close_after_chat(true);
                ctx.set_client_abort(false);

                let config = ctx.config();
                if !config.dialogue.end_prompt.enable {
                    bus.publish(Event::new(
                        ctx.session_id.clone(),
                        EventPayload::SessionDestroying,
                    ))
                    .await;
                    return;
                }
                let prompt = if config.dialogue.end_prompt.prompt.is_empty() {
                    "请你以“时间过得真快”为开头，用富有感情、依依不舍的话来结束这场对话吧！"
                        .to_string()
                } else {
                    config.dialogue.end_prompt.prompt.clone()
                };
                bus.publish(Event::new(
                    ctx.session_id.clone(),
                    EventPayload::TranscriptReady {
                        text: prompt,
                        is_final: true,
                        confidence: None,
                    },
                ))
                .await;
            }
        });
    }
}
