//! Intent gate
//!
//! Runs before the dialogue LLM, cheaply: exit commands and wake words are
//! string matches on the normalized transcript, and an optional classifier
//! model turns the rest into structured function calls. A handled message
//! is *absorbed* and never reaches the dialogue LLM.

use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use voice_gateway_core::text::remove_punctuation_and_length;
use voice_gateway_core::{
    DialogueMessage, Event, EventBus, EventPayload, Role, SentenceType, SessionContext,
};
use voice_gateway_llm::intent::{CONTINUE_CHAT, RESULT_FOR_CONTEXT};
use voice_gateway_llm::{IntentModel, ToolCallRequest};
use voice_gateway_pipeline::{TtsEngine, TtsOrchestrator};
use voice_gateway_tools::{Action, PluginContext, ToolDispatcher};
use voice_gateway_transport::Transport;

use crate::calendar;
use crate::wakeup::{WakeupCache, RESPONSES};

pub struct IntentService {
    bus: Arc<EventBus>,
    orchestrator: Arc<TtsOrchestrator>,
    dispatcher: Arc<ToolDispatcher>,
    intent_model: Option<Arc<dyn IntentModel>>,
    tts_engine: Arc<dyn TtsEngine>,
    wakeup_cache: Arc<WakeupCache>,
    /// Voice identity keying the greeting cache.
    voice: String,
}

impl IntentService {
    pub fn new(
        bus: Arc<EventBus>,
        orchestrator: Arc<TtsOrchestrator>,
        dispatcher: Arc<ToolDispatcher>,
        intent_model: Option<Arc<dyn IntentModel>>,
        tts_engine: Arc<dyn TtsEngine>,
        wakeup_cache: Arc<WakeupCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            orchestrator,
            dispatcher,
            intent_model,
            tts_engine,
            wakeup_cache,
            voice: "default".to_string(),
        })
    }

    /// Returns `true` when the message was absorbed here.
    pub async fn handle_user_intent(
        &self,
        ctx: &Arc<SessionContext>,
        transport: &Arc<dyn Transport>,
        plugin_ctx: &PluginContext,
        raw_text: &str,
    ) -> bool {
        // Speaker-identified transcripts arrive as a JSON envelope; intent
        // matching runs on the content.
        let text = match voice_gateway_core::text::parse_speaker_envelope(raw_text) {
            Some((speaker, content)) => {
                ctx.set_current_speaker(speaker);
                content
            }
            None => raw_text.to_string(),
        };
        let (_, normalized) = remove_punctuation_and_length(&text);
        let config = ctx.config();

        if config
            .dialogue
            .exit_commands
            .iter()
            .any(|cmd| normalized == *cmd)
        {
            tracing::info!(session_id = %ctx.session_id, text = %normalized, "exit command");
            self.send_stt(ctx, transport, &text).await;
            self.send_tts_stop(ctx, transport).await;
            self.bus
                .publish(Event::new(
                    ctx.session_id.clone(),
                    EventPayload::SessionDestroying,
                ))
                .await;
            return true;
        }

        if config.dialogue.wakeup_words.contains(&normalized) {
            self.handle_wakeup(ctx, transport, &text).await;
            return true;
        }

        if config.intent.mode == voice_gateway_config::IntentMode::FunctionCall {
            // The dialogue LLM owns tool selection in this mode.
            return false;
        }

        let Some(model) = self.intent_model.as_ref() else {
            return false;
        };
        let classification = {
            let dialogue = ctx.dialogue.lock().snapshot();
            match model.detect_intent(&dialogue, &text).await {
                Ok(result) => result,
                Err(err) => {
                    tracing::error!(session_id = %ctx.session_id, error = %err, "intent detection failed");
                    return false;
                }
            }
        };
        self.process_classification(ctx, transport, plugin_ctx, model.clone(), &text, &classification)
            .await
    }

    async fn handle_wakeup(
        &self,
        ctx: &Arc<SessionContext>,
        transport: &Arc<dyn Transport>,
        text: &str,
    ) {
        let config = ctx.config();
        if !config.dialogue.enable_greeting {
            // No reply wanted: echo and close the (empty) turn.
            self.send_stt(ctx, transport, text).await;
            self.send_tts_stop(ctx, transport).await;
            ctx.set_speaking(false);
            return;
        }

        ctx.set_just_woken_up(true);
        ctx.set_client_abort(false);

        if config.dialogue.enable_wakeup_words_response_cache {
            if let Some(cached) = self.wakeup_cache.get(&self.voice) {
                tracing::info!(session_id = %ctx.session_id, text = %cached.text, "cached greeting");
                ctx.mint_sentence_id();
                self.orchestrator.push_audio_chunk(
                    &ctx.session_id,
                    SentenceType::First,
                    cached.frames,
                    Some(cached.text.clone()),
                );
                self.orchestrator.push_audio_chunk(
                    &ctx.session_id,
                    SentenceType::Last,
                    Vec::new(),
                    None,
                );
                ctx.dialogue
                    .lock()
                    .put(DialogueMessage::new(Role::Assistant, cached.text));
                if cached.stale {
                    self.wakeup_cache
                        .spawn_refresh(self.tts_engine.clone(), self.voice.clone());
                }
                return;
            }
        }

        let greeting = if config.dialogue.greeting.is_empty() {
            RESPONSES[0].to_string()
        } else {
            config.dialogue.greeting.clone()
        };
        self.speak(ctx, &greeting).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_classification(
        &self,
        ctx: &Arc<SessionContext>,
        transport: &Arc<dyn Transport>,
        plugin_ctx: &PluginContext,
        model: Arc<dyn IntentModel>,
        text: &str,
        classification: &str,
    ) -> bool {
        let Ok(parsed) = serde_json::from_str::<Value>(classification) else {
            tracing::debug!("unstructured intent result, continuing chat");
            return false;
        };
        let Some(call) = parsed.get("function_call") else {
            return false;
        };
        let Some(name) = call.get("name").and_then(Value::as_str) else {
            return false;
        };
        if name == CONTINUE_CHAT {
            return false;
        }

        let arguments = call.get("arguments").cloned().unwrap_or(Value::Null);
        self.bus
            .publish(Event::new(
                ctx.session_id.clone(),
                EventPayload::IntentRecognized {
                    intent: name.to_string(),
                    arguments: arguments.clone(),
                },
            ))
            .await;

        if name == RESULT_FOR_CONTEXT {
            self.send_stt(ctx, transport, text).await;
            ctx.set_client_abort(false);
            ctx.dialogue
                .lock()
                .put(DialogueMessage::new(Role::User, text));
            let prompt = calendar::context_prompt(text);
            match model.reply_result(&prompt, text).await {
                Ok(reply) => self.speak(ctx, &reply).await,
                Err(err) => {
                    tracing::error!(error = %err, "context reply failed");
                    return false;
                }
            }
            return true;
        }

        self.send_stt(ctx, transport, text).await;
        ctx.set_client_abort(false);
        ctx.dialogue
            .lock()
            .put(DialogueMessage::new(Role::User, text));

        let request = ToolCallRequest {
            id: Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            arguments: if arguments.is_null() {
                "{}".to_string()
            } else {
                arguments.to_string()
            },
        };
        self.bus
            .publish(Event::new(
                ctx.session_id.clone(),
                EventPayload::ToolCallRequest {
                    tool_name: request.name.clone(),
                    tool_call_id: request.id.clone(),
                    arguments: arguments.clone(),
                },
            ))
            .await;

        let result = self.dispatcher.dispatch(plugin_ctx, &request).await;
        self.bus
            .publish(Event::new(
                ctx.session_id.clone(),
                EventPayload::ToolCallResponse {
                    tool_call_id: request.id.clone(),
                    ok: result.action != Action::Error,
                },
            ))
            .await;

        match result.action {
            Action::Response => {
                if let Some(response) = result.response {
                    self.speak(ctx, &response).await;
                }
            }
            Action::ReqLlm => {
                let tool_output = result.result.unwrap_or_default();
                ctx.dialogue
                    .lock()
                    .put(DialogueMessage::tool(tool_output.clone(), request.id));
                let reply = model
                    .reply_result(&tool_output, text)
                    .await
                    .unwrap_or(tool_output);
                self.speak(ctx, &reply).await;
            }
            Action::NotFound | Action::Error => {
                if let Some(diagnostic) = result.result {
                    self.speak(ctx, &diagnostic).await;
                }
            }
            Action::None => {}
        }
        true
    }

    async fn speak(&self, ctx: &Arc<SessionContext>, text: &str) {
        ctx.mint_sentence_id();
        self.orchestrator
            .synthesize_one_sentence(&ctx.session_id, text);
        ctx.dialogue
            .lock()
            .put(DialogueMessage::new(Role::Assistant, text));
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

    async fn send_tts_stop(&self, ctx: &Arc<SessionContext>, transport: &Arc<dyn Transport>) {
        let message = serde_json::json!({
            "type": "tts",
            "state": "stop",
            "session_id": ctx.session_id,
        });
        if let Err(err) = transport.send_json(&message).await {
            tracing::debug!(session_id = %ctx.session_id, error = %err, "tts stop failed");
        }
    }
}
