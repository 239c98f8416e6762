//! Dialogue-service scenarios driven through the real event bus, TTS
//! orchestrator and tool dispatcher, with scripted model providers.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use voice_gateway_agent::{
    service_names, AbortService, DialogueService, IntentService, OutputCounter, WakeupCache,
};
use voice_gateway_config::{GatewayConfig, IntentMode};
use voice_gateway_core::events::AbortReason;
use voice_gateway_core::{
    Container, Event, EventBus, EventKind, EventPayload, ListenMode, Role, SessionContext,
};
use voice_gateway_llm::testing::ScriptedLlm;
use voice_gateway_llm::{LlmChunk, ToolCallRequest};
use voice_gateway_pipeline::{PipelineError, TtsEngine, TtsOrchestrator};
use voice_gateway_tools::{
    ActionResponse, PluginContext, Tool, ToolDispatcher, ToolError, ToolKind, ToolRegistry,
};
use voice_gateway_transport::{Frame, SharedTransport, Transport, TransportError};

struct FakeTts;

#[async_trait]
impl TtsEngine for FakeTts {
    async fn synthesize(&self, _text: &str) -> Result<Vec<Vec<u8>>, PipelineError> {
        Ok(vec![vec![0u8; 12]; 2])
    }
}

#[derive(Default)]
struct RecordingTransport {
    messages: Mutex<Vec<Value>>,
    binary_frames: AtomicUsize,
}

impl RecordingTransport {
    fn states(&self) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m["type"] == "tts")
            .filter_map(|m| m["state"].as_str().map(String::from))
            .collect()
    }

    fn stt_texts(&self) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m["type"] == "stt")
            .filter_map(|m| m["text"].as_str().map(String::from))
            .collect()
    }

    fn captions(&self) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m["type"] == "tts" && m["state"] == "sentence_start")
            .filter_map(|m| m["text"].as_str().map(String::from))
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.messages
            .lock()
            .push(serde_json::from_str(text).unwrap());
        Ok(())
    }

    async fn send_binary(&self, _data: &[u8]) -> Result<(), TransportError> {
        self.binary_frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn recv(&self) -> Option<Frame> {
        None
    }

    async fn close(&self) {}

    fn is_connected(&self) -> bool {
        true
    }
}

struct Harness {
    bus: Arc<EventBus>,
    ctx: Arc<SessionContext>,
    transport: Arc<RecordingTransport>,
    llm: Arc<ScriptedLlm>,
    _cache_dir: tempfile::TempDir,
}

fn registry_with(tools: Vec<Arc<dyn Tool>>) -> &'static ToolRegistry {
    let registry = Box::leak(Box::new(ToolRegistry::new()));
    for tool in tools {
        registry.register(tool);
    }
    registry.seal();
    registry
}

async fn build_harness(
    config: GatewayConfig,
    registry: &'static ToolRegistry,
    intent_model: Option<Arc<dyn voice_gateway_llm::IntentModel>>,
) -> Harness {
    let container = Arc::new(Container::new());
    let bus = Arc::new(EventBus::new());
    let transport = Arc::new(RecordingTransport::default());
    let llm = Arc::new(ScriptedLlm::new());
    let tts_engine: Arc<dyn TtsEngine> = Arc::new(FakeTts);

    let ctx = SessionContext::new(
        "s1",
        Some("aa:bb:cc:dd:ee:ff".to_string()),
        None,
        None,
        false,
        config,
    );
    container.register_session_value(
        "s1",
        service_names::SESSION_CONTEXT,
        ctx.clone(),
    );
    let shared: Arc<dyn Transport> = transport.clone();
    container.register_session_value(
        "s1",
        service_names::TRANSPORT,
        Arc::new(SharedTransport(shared)),
    );

    let orchestrator = TtsOrchestrator::new(tts_engine.clone(), bus.clone());
    orchestrator.register(ctx.clone(), transport.clone());

    let cache_dir = tempfile::tempdir().unwrap();
    let dispatcher = Arc::new(ToolDispatcher::new(registry));
    let intent = IntentService::new(
        bus.clone(),
        orchestrator.clone(),
        dispatcher.clone(),
        intent_model,
        tts_engine,
        Arc::new(WakeupCache::new(cache_dir.path())),
    );
    let dialogue = DialogueService::new(
        container.clone(),
        bus.clone(),
        orchestrator.clone(),
        llm.clone(),
        dispatcher,
        intent,
        None,
        Arc::new(OutputCounter::new()),
    );
    dialogue.register(&bus);

    let abort = AbortService::new(container.clone(), orchestrator);
    abort.register(&bus);

    Harness {
        bus,
        ctx,
        transport,
        llm,
        _cache_dir: cache_dir,
    }
}

async fn say(harness: &Harness, text: &str) {
    harness
        .bus
        .publish(Event::new(
            "s1",
            EventPayload::TranscriptReady {
                text: text.to_string(),
                is_final: true,
                confidence: None,
            },
        ))
        .await;
}

async fn wait_for_stop(transport: &RecordingTransport) {
    for _ in 0..500 {
        if transport.states().iter().any(|s| s == "stop") {
            return;
        }
        sleep(Duration::from_millis(2)).await;
    }
    panic!("no stop observed, states: {:?}", transport.states());
}

fn empty_registry() -> &'static ToolRegistry {
    registry_with(Vec::new())
}

#[tokio::test]
async fn simple_utterance_produces_one_bracketed_turn() {
    let harness = build_harness(GatewayConfig::default(), empty_registry(), None).await;
    harness.llm.push_script(vec![LlmChunk::text("你好呀")]);

    say(&harness, "在吗").await;
    wait_for_stop(&harness.transport).await;

    assert_eq!(harness.transport.stt_texts(), vec!["在吗".to_string()]);
    assert_eq!(
        harness.transport.states(),
        vec!["start", "sentence_start", "stop"]
    );
    assert_eq!(harness.transport.captions(), vec!["你好呀".to_string()]);
    assert!(harness.transport.binary_frames.load(Ordering::SeqCst) >= 1);

    let dialogue = harness.ctx.dialogue.lock().snapshot();
    assert_eq!(dialogue.len(), 2);
    assert_eq!(dialogue[0].role, Role::User);
    assert_eq!(dialogue[1].role, Role::Assistant);
    assert_eq!(dialogue[1].content, "你好呀");
    assert!(harness.ctx.llm_finished());
}

struct PlayMusic;

#[async_trait]
impl Tool for PlayMusic {
    fn name(&self) -> &str {
        "play_music"
    }

    fn description(&self) -> &str {
        "play a song by name"
    }

    fn kind(&self) -> ToolKind {
        ToolKind::SystemCtl
    }

    async fn invoke(
        &self,
        _context: &PluginContext,
        arguments: Value,
    ) -> Result<ActionResponse, ToolError> {
        let song = arguments["song"].as_str().unwrap_or("未知");
        Ok(ActionResponse::response(format!("正在为您播放，《{song}》")))
    }
}

#[tokio::test]
async fn tool_call_with_response_action_is_spoken() {
    let mut config = GatewayConfig::default();
    config.intent.mode = IntentMode::FunctionCall;
    let registry = registry_with(vec![Arc::new(PlayMusic) as Arc<dyn Tool>]);
    let harness = build_harness(config, registry, None).await;

    harness.llm.push_script(vec![LlmChunk::tool_call(ToolCallRequest {
        id: "c1".into(),
        name: "play_music".into(),
        arguments: r#"{"song": "两只老虎"}"#.into(),
    })]);

    say(&harness, "播放音乐两只老虎").await;
    wait_for_stop(&harness.transport).await;

    assert_eq!(
        harness.transport.captions(),
        vec!["正在为您播放，《两只老虎》".to_string()]
    );
    let dialogue = harness.ctx.dialogue.lock().snapshot();
    assert_eq!(dialogue[0].role, Role::User);
    assert_eq!(dialogue[1].role, Role::Assistant);
    assert_eq!(dialogue[1].content, "正在为您播放，《两只老虎》");
    // The dialogue LLM received tool definitions.
    assert!(harness.llm.calls.lock()[0].1);
}

struct AlwaysReqLlm;

#[async_trait]
impl Tool for AlwaysReqLlm {
    fn name(&self) -> &str {
        "lookup"
    }

    fn description(&self) -> &str {
        "look something up"
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Wait
    }

    async fn invoke(
        &self,
        _context: &PluginContext,
        _arguments: Value,
    ) -> Result<ActionResponse, ToolError> {
        Ok(ActionResponse::req_llm("查到了一条数据"))
    }
}

#[tokio::test]
async fn tool_recursion_is_capped_and_final_round_has_no_tools() {
    let mut config = GatewayConfig::default();
    config.intent.mode = IntentMode::FunctionCall;
    let registry = registry_with(vec![Arc::new(AlwaysReqLlm) as Arc<dyn Tool>]);
    let harness = build_harness(config, registry, None).await;

    for i in 0..5 {
        harness.llm.push_script(vec![LlmChunk::tool_call(ToolCallRequest {
            id: format!("c{i}"),
            name: "lookup".into(),
            arguments: "{}".into(),
        })]);
    }
    harness.llm.push_script(vec![LlmChunk::text("最终回答")]);

    say(&harness, "查一下").await;
    wait_for_stop(&harness.transport).await;

    let calls = harness.llm.calls.lock();
    assert_eq!(calls.len(), 6);
    for call in calls.iter().take(5) {
        assert!(call.1, "tool rounds should carry definitions");
    }
    assert!(!calls[5].1, "depth limit forces a textual answer");

    let dialogue = harness.ctx.dialogue.lock().snapshot();
    let tool_messages = dialogue.iter().filter(|m| m.role == Role::Tool).count();
    assert_eq!(tool_messages, 5);
    assert_eq!(dialogue.last().unwrap().content, "最终回答");
}

#[tokio::test]
async fn exit_command_stops_without_a_turn() {
    let mut config = GatewayConfig::default();
    config.dialogue.exit_commands = vec!["再见".to_string()];
    let harness = build_harness(config, empty_registry(), None).await;

    let destroyed = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let destroyed2 = destroyed.clone();
    harness
        .bus
        .subscribe_sync(EventKind::SessionDestroying, move |_| {
            destroyed2.store(true, Ordering::SeqCst);
        });

    say(&harness, "再见！").await;

    assert!(destroyed.load(Ordering::SeqCst));
    assert_eq!(harness.transport.stt_texts(), vec!["再见！".to_string()]);
    assert_eq!(harness.transport.states(), vec!["stop"]);
    assert!(harness.llm.calls.lock().is_empty());
}

#[tokio::test]
async fn barge_in_aborts_only_outside_manual_mode() {
    let harness = build_harness(GatewayConfig::default(), empty_registry(), None).await;
    let aborts = Arc::new(AtomicUsize::new(0));
    let aborts2 = aborts.clone();
    harness
        .bus
        .subscribe_sync(EventKind::ClientAbort, move |event| {
            if let EventPayload::ClientAbort { reason } = &event.payload {
                assert_eq!(*reason, AbortReason::UserInterrupt);
                aborts2.fetch_add(1, Ordering::SeqCst);
            }
        });

    // Manual mode: no abort while speaking.
    harness.ctx.set_speaking(true);
    harness.ctx.set_listen_mode(ListenMode::Manual);
    harness.llm.push_script(vec![LlmChunk::text("好")]);
    say(&harness, "第一句").await;
    assert_eq!(aborts.load(Ordering::SeqCst), 0);

    // Auto mode: speaking state triggers the abort before the new turn.
    harness.ctx.set_speaking(true);
    harness.ctx.set_listen_mode(ListenMode::Auto);
    harness.llm.push_script(vec![LlmChunk::text("好")]);
    say(&harness, "第二句").await;
    assert_eq!(aborts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn wake_word_with_greeting_disabled_only_echoes() {
    let mut config = GatewayConfig::default();
    config.dialogue.wakeup_words = vec!["你好小智".to_string()];
    config.dialogue.enable_greeting = false;
    let harness = build_harness(config, empty_registry(), None).await;

    say(&harness, "你好小智。").await;

    assert_eq!(harness.transport.stt_texts(), vec!["你好小智。".to_string()]);
    assert_eq!(harness.transport.states(), vec!["stop"]);
    assert!(harness.llm.calls.lock().is_empty());
}

#[tokio::test]
async fn wake_word_greeting_marks_wake_suppression() {
    let mut config = GatewayConfig::default();
    config.dialogue.wakeup_words = vec!["你好小智".to_string()];
    config.dialogue.greeting = "我在呢".to_string();
    let harness = build_harness(config, empty_registry(), None).await;

    say(&harness, "你好小智").await;
    wait_for_stop(&harness.transport).await;

    assert!(harness.ctx.just_woken_up());
    assert_eq!(harness.transport.captions(), vec!["我在呢".to_string()]);
    let dialogue = harness.ctx.dialogue.lock().snapshot();
    assert_eq!(dialogue.last().unwrap().content, "我在呢");
    assert!(harness.llm.calls.lock().is_empty());
}

#[tokio::test]
async fn daily_budget_cap_closes_after_the_clip() {
    let mut config = GatewayConfig::default();
    config.dialogue.max_output_size = 10;
    let registry = empty_registry();

    // Build with a counter that is already exhausted.
    let container = Arc::new(Container::new());
    let bus = Arc::new(EventBus::new());
    let transport = Arc::new(RecordingTransport::default());
    let llm = Arc::new(ScriptedLlm::new());
    let tts_engine: Arc<dyn TtsEngine> = Arc::new(FakeTts);
    let ctx = SessionContext::new(
        "s1",
        Some("dev-1".to_string()),
        None,
        None,
        false,
        config,
    );
    container.register_session_value("s1", service_names::SESSION_CONTEXT, ctx.clone());
    let shared: Arc<dyn Transport> = transport.clone();
    container.register_session_value(
        "s1",
        service_names::TRANSPORT,
        Arc::new(SharedTransport(shared)),
    );
    let orchestrator = TtsOrchestrator::new(tts_engine.clone(), bus.clone());
    orchestrator.register(ctx.clone(), transport.clone());
    let cache_dir = tempfile::tempdir().unwrap();
    let dispatcher = Arc::new(ToolDispatcher::new(registry));
    let intent = IntentService::new(
        bus.clone(),
        orchestrator.clone(),
        dispatcher.clone(),
        None,
        tts_engine,
        Arc::new(WakeupCache::new(cache_dir.path())),
    );
    let counter = Arc::new(OutputCounter::new());
    counter.add("dev-1", 100);
    let dialogue = DialogueService::new(
        container,
        bus.clone(),
        orchestrator,
        llm.clone(),
        dispatcher,
        intent,
        None,
        counter,
    );
    dialogue.register(&bus);

    bus.publish(Event::new(
        "s1",
        EventPayload::TranscriptReady {
            text: "讲个故事".to_string(),
            is_final: true,
            confidence: None,
        },
    ))
    .await;
    wait_for_stop(&transport).await;

    assert!(ctx.close_after_chat());
    assert!(llm.calls.lock().is_empty());
    let stt = transport.stt_texts();
    assert_eq!(stt.len(), 1);
    assert!(stt[0].contains("明天"));
}

#[tokio::test]
async fn intent_classifier_dispatches_function_calls() {
    use voice_gateway_llm::testing::FixedIntent;

    let mut config = GatewayConfig::default();
    config.intent.mode = IntentMode::IntentLlm;
    let registry = registry_with(vec![Arc::new(PlayMusic) as Arc<dyn Tool>]);
    let intent_model: Arc<dyn voice_gateway_llm::IntentModel> = Arc::new(
        FixedIntent::function_call("play_music", serde_json::json!({"song": "小星星"})),
    );
    let harness = build_harness(config, registry, Some(intent_model)).await;

    say(&harness, "放首小星星").await;
    wait_for_stop(&harness.transport).await;

    assert_eq!(
        harness.transport.captions(),
        vec!["正在为您播放，《小星星》".to_string()]
    );
    // Absorbed by the intent gate: the dialogue LLM never ran.
    assert!(harness.llm.calls.lock().is_empty());
}
