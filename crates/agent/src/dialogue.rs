//! Dialogue service
//!
//! Consumes final transcripts, drives the streaming LLM, forwards sentences
//! to the TTS orchestrator and executes tool calls. One assistant turn is
//! in flight at most; the `llm_finish_task` flag guards the next one.

use std::sync::Arc;

use voice_gateway_core::events::AbortReason;
use voice_gateway_core::{
    Container, DialogueMessage, Event, EventBus, EventKind, EventPayload, ListenMode, Role,
    SentenceType, SessionContext,
};
use voice_gateway_llm::{LanguageModel, MemoryProvider, ToolDefinition};
use voice_gateway_pipeline::codec::load_wav_as_opus_frames;
use voice_gateway_pipeline::TtsOrchestrator;
use voice_gateway_tools::{global_registry, Action, McpClient, PluginContext, ToolDispatcher};
use voice_gateway_transport::{SharedTransport, Transport};

use crate::intent::IntentService;
use crate::{service_names, OutputCounter};

/// Tool-call recursion limit; the final round runs without tool
/// definitions to force a textual answer.
const MAX_TOOL_DEPTH: usize = 5;

const QUOTA_EXCEEDED_TEXT: &str =
    "不好意思，我现在有点事情要忙，明天这个时候我们再聊，约好了哦！明天不见不散，拜拜！";
const BIND_NOT_FOUND_TEXT: &str =
    "没有找到该设备的版本信息，请正确配置 OTA地址，然后重新编译固件。";

pub struct DialogueService {
    container: Arc<Container>,
    bus: Arc<EventBus>,
    orchestrator: Arc<TtsOrchestrator>,
    llm: Arc<dyn LanguageModel>,
    dispatcher: Arc<ToolDispatcher>,
    intent: Arc<IntentService>,
    memory: Option<Arc<dyn MemoryProvider>>,
    counter: Arc<OutputCounter>,
}

impl DialogueService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        container: Arc<Container>,
        bus: Arc<EventBus>,
        orchestrator: Arc<TtsOrchestrator>,
        llm: Arc<dyn LanguageModel>,
        dispatcher: Arc<ToolDispatcher>,
        intent: Arc<IntentService>,
        memory: Option<Arc<dyn MemoryProvider>>,
        counter: Arc<OutputCounter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            container,
            bus,
            orchestrator,
            llm,
            dispatcher,
            intent,
            memory,
            counter,
        })
    }

    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        let service = self.clone();
        bus.subscribe(EventKind::TranscriptReady, move |event| {
            let service = service.clone();
            async move { service.handle_transcript(event).await }
        });
    }

    async fn handle_transcript(self: Arc<Self>, event: Event) {
        let EventPayload::TranscriptReady { text, is_final, .. } = event.payload else {
            return;
        };
        if !is_final {
            return;
        }
        let session_id = event.session_id;

        let Ok(ctx) = self
            .container
            .resolve_typed::<SessionContext>(service_names::SESSION_CONTEXT, Some(&session_id))
        else {
            tracing::debug!(%session_id, "transcript for unknown session");
            return;
        };
        let Ok(shared) = self
            .container
            .resolve_typed::<SharedTransport>(service_names::TRANSPORT, Some(&session_id))
        else {
            return;
        };
        let transport = shared.0.clone();

        if ctx.need_bind() {
            self.handle_bind_flow(&ctx, &transport).await;
            return;
        }
        if self.enforce_output_budget(&ctx, &transport).await {
            return;
        }

        // Barge-in: the bus delivers the abort synchronously, so the turn
        // below starts against cleared queues.
        if ctx.is_speaking() && ctx.listen_mode() != ListenMode::Manual {
            self.bus
                .publish(Event::new(
                    session_id.clone(),
                    EventPayload::ClientAbort {
                        reason: AbortReason::UserInterrupt,
                    },
                ))
                .await;
        }

        let plugin_ctx = PluginContext {
            session: ctx.clone(),
            container: self.container.clone(),
            bus: self.bus.clone(),
        };
        if self
            .intent
            .handle_user_intent(&ctx, &transport, &plugin_ctx, &text)
            .await
        {
            return;
        }

        if !ctx.llm_finished() {
            tracing::warn!(%session_id, "turn already in flight, transcript dropped");
            return;
        }
        ctx.set_llm_finished(false);
        ctx.set_client_abort(false);

        self.send_stt(&ctx, &transport, &text).await;
        ctx.mint_sentence_id();
        ctx.dialogue
            .lock()
            .put(DialogueMessage::new(Role::User, &text));
        self.orchestrator.add_first(&session_id);

        self.bus
            .publish(Event::new(
                session_id.clone(),
                EventPayload::LlmRequest { text: text.clone() },
            ))
            .await;
        self.process_turn(&ctx, &plugin_ctx, &text, 0).await;

        self.orchestrator.add_last(&session_id);
        ctx.set_llm_finished(true);
    }

    /// One LLM round. Tool calls recurse with `depth + 1`; at the depth
    /// limit the model runs without tool definitions.
    async fn process_turn(
        &self,
        ctx: &Arc<SessionContext>,
        plugin_ctx: &PluginContext,
        original_text: &str,
        depth: usize,
    ) {
        let session_id = ctx.session_id.clone();
        let messages = self.assemble_messages(ctx, original_text).await;
        let tools = self.tool_definitions(ctx, depth);

        let mut stream = match self
            .llm
            .chat_stream(&session_id, messages, tools)
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(%session_id, error = %err, "llm request failed");
                self.bus
                    .publish(Event::new(
                        session_id,
                        EventPayload::LlmError {
                            message: err.to_string(),
                        },
                    ))
                    .await;
                return;
            }
        };

        let mut response_chunks: Vec<String> = Vec::new();
        let mut tool_calls = Vec::new();
        while let Some(chunk) = stream.recv().await {
            if ctx.client_abort() {
                tracing::debug!(session_id = %ctx.session_id, "llm stream cut by abort");
                break;
            }
            if let Some(text) = chunk.text {
                if !text.is_empty() {
                    self.orchestrator.add_text(&ctx.session_id, text.clone());
                    response_chunks.push(text);
                }
            }
            tool_calls.extend(chunk.tool_calls);
        }

        if !tool_calls.is_empty() && !ctx.client_abort() {
            for call in tool_calls {
                if ctx.client_abort() {
                    break;
                }
                self.bus
                    .publish(Event::new(
                        ctx.session_id.clone(),
                        EventPayload::ToolCallRequest {
                            tool_name: call.name.clone(),
                            tool_call_id: call.id.clone(),
                            arguments: serde_json::from_str(&call.arguments)
                                .unwrap_or(serde_json::Value::Null),
                        },
                    ))
                    .await;

                let result = self.dispatcher.dispatch(plugin_ctx, &call).await;
                self.bus
                    .publish(Event::new(
                        ctx.session_id.clone(),
                        EventPayload::ToolCallResponse {
                            tool_call_id: call.id.clone(),
                            ok: result.action != Action::Error,
                        },
                    ))
                    .await;

                match result.action {
                    Action::Response => {
                        if let Some(response) = result.response {
                            self.orchestrator.add_text(&ctx.session_id, response.clone());
                            self.record_assistant_text(ctx, response);
                        }
                    }
                    Action::ReqLlm => {
                        let output = result.result.unwrap_or_default();
                        ctx.dialogue
                            .lock()
                            .put(DialogueMessage::tool(output, call.id.clone()));
                        Box::pin(self.process_turn(ctx, plugin_ctx, original_text, depth + 1))
                            .await;
                    }
                    Action::NotFound | Action::Error => {
                        if let Some(diagnostic) = result.result {
                            self.orchestrator.add_text(&ctx.session_id, diagnostic);
                        }
                    }
                    Action::None => {}
                }
            }
        } else if !response_chunks.is_empty() {
            let full = response_chunks.concat();
            ctx.set_tts_message_text(full.clone());
            self.bus
                .publish(Event::new(
                    ctx.session_id.clone(),
                    EventPayload::LlmResponse { text: full.clone() },
                ))
                .await;
            self.record_assistant_text(ctx, full);
        }
    }

    async fn assemble_messages(
        &self,
        ctx: &Arc<SessionContext>,
        text: &str,
    ) -> Vec<DialogueMessage> {
        let mut messages = ctx.dialogue.lock().snapshot();
        if let Some(memory) = self.memory.as_ref() {
            match memory.query_memory(text).await {
                Ok(Some(snippet)) => {
                    let position = usize::from(
                        messages.first().is_some_and(|m| m.role == Role::System),
                    );
                    messages.insert(
                        position,
                        DialogueMessage::new(
                            Role::System,
                            format!("以下是与用户相关的记忆：\n{snippet}"),
                        ),
                    );
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(error = %err, "memory query failed"),
            }
        }
        messages
    }

    fn tool_definitions(
        &self,
        ctx: &Arc<SessionContext>,
        depth: usize,
    ) -> Option<Vec<ToolDefinition>> {
        if ctx.config().intent.mode != voice_gateway_config::IntentMode::FunctionCall {
            return None;
        }
        if depth >= MAX_TOOL_DEPTH {
            return None;
        }
        let mut definitions = global_registry().definitions();
        if let Ok(mcp) = self
            .container
            .resolve_typed::<McpClient>(service_names::MCP_CLIENT, Some(&ctx.session_id))
        {
            definitions.extend(mcp.tool_definitions());
        }
        Some(definitions)
    }

    fn record_assistant_text(&self, ctx: &Arc<SessionContext>, text: String) {
        if let Some(device_id) = ctx.device_id.as_deref() {
            self.counter.add(device_id, text.chars().count());
        }
        ctx.dialogue
            .lock()
            .put(DialogueMessage::new(Role::Assistant, text));
    }

    /// Unbound devices get the bind-code clips instead of a dialogue.
    async fn handle_bind_flow(&self, ctx: &Arc<SessionContext>, transport: &Arc<dyn Transport>) {
        let config = ctx.config();
        let session_id = &ctx.session_id;

        match ctx.bind_code() {
            Some(code) if code.len() == 6 => {
                let text = format!("请登录控制面板，输入{code}，绑定设备。");
                self.send_stt(ctx, transport, &text).await;
                ctx.mint_sentence_id();

                match load_wav_as_opus_frames(&config.assets.bind_code_clip) {
                    Ok(frames) => {
                        self.orchestrator.push_audio_chunk(
                            session_id,
                            SentenceType::First,
                            frames,
                            Some(text),
                        );
                        for digit in code.chars() {
                            let clip = config.assets.bind_digits_dir.join(format!("{digit}.wav"));
                            match load_wav_as_opus_frames(&clip) {
                                Ok(frames) => self.orchestrator.push_audio_chunk(
                                    session_id,
                                    SentenceType::Middle,
                                    frames,
                                    None,
                                ),
                                Err(err) => {
                                    tracing::error!(digit = %digit, error = %err, "digit clip missing")
                                }
                            }
                        }
                        self.orchestrator.push_audio_chunk(
                            session_id,
                            SentenceType::Last,
                            Vec::new(),
                            None,
                        );
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "bind clip missing, synthesizing");
                        self.orchestrator.synthesize_one_sentence(session_id, text);
                    }
                }
            }
            Some(code) => {
                tracing::error!(code = %code, "bind code must be six digits");
                ctx.mint_sentence_id();
                self.orchestrator
                    .synthesize_one_sentence(session_id, "绑定码格式错误，请检查配置。");
            }
            None => {
                ctx.set_client_abort(false);
                self.send_stt(ctx, transport, BIND_NOT_FOUND_TEXT).await;
                ctx.mint_sentence_id();
                match load_wav_as_opus_frames(&config.assets.bind_not_found_clip) {
                    Ok(frames) => self.orchestrator.push_audio_chunk(
                        session_id,
                        SentenceType::Last,
                        frames,
                        Some(BIND_NOT_FOUND_TEXT.to_string()),
                    ),
                    Err(_) => self
                        .orchestrator
                        .synthesize_one_sentence(session_id, BIND_NOT_FOUND_TEXT),
                }
            }
        }
    }

    /// True when the daily cap absorbed the message.
    async fn enforce_output_budget(
        &self,
        ctx: &Arc<SessionContext>,
        transport: &Arc<dyn Transport>,
    ) -> bool {
        let config = ctx.config();
        let max = config.dialogue.max_output_size;
        if max == 0 {
            return false;
        }
        let Some(device_id) = ctx.device_id.as_deref() else {
            return false;
        };
        if !self.counter.exceeded(device_id, max) {
            return false;
        }

        tracing::info!(session_id = %ctx.session_id, device_id, "daily output budget reached");
        ctx.set_client_abort(false);
        self.send_stt(ctx, transport, QUOTA_EXCEEDED_TEXT).await;
        ctx.mint_sentence_id();
        match load_wav_as_opus_frames(&config.assets.max_output_clip) {
            Ok(frames) => self.orchestrator.push_audio_chunk(
                &ctx.session_id,
                SentenceType::Last,
                frames,
                Some(QUOTA_EXCEEDED_TEXT.to_string()),
            ),
            Err(_) => self
                .orchestrator
                .synthesize_one_sentence(&ctx.session_id, QUOTA_EXCEEDED_TEXT),
        }
        ctx.set_close_after_chat(true);
        true
    }

    async fn send_stt(
        &self,
        ctx: &Arc<SessionContext>,
        transport: &Arc<dyn Transport>,
        text: &str,
    ) {
        let message = serde_json::json!({
            "type": "stt",
            "text": text,
            "session_id": ctx.session_id,
        });
        if let Err(err) = transport.send_json(&message).await {
            tracing::debug!(session_id = %ctx.session_id, error = %err, "stt echo failed");
        }
    }
}
