//! Tool dispatch
//!
//! Resolves a model-emitted call against the registry and runs it with the
//! session's [`PluginContext`]. MCP-kind tools are forwarded to the device
//! client instead of running server-side. Failures never propagate: every
//! outcome folds into an [`ActionResponse`] the dialogue layer can speak.

use serde_json::Value;
use std::sync::Arc;

use voice_gateway_core::{Container, EventBus, SessionContext};
use voice_gateway_llm::ToolCallRequest;

use crate::registry::{ToolKind, ToolRegistry};
use crate::{ActionResponse, McpClient, ToolError};

/// Capabilities handed to a tool invocation.
#[derive(Clone)]
pub struct PluginContext {
    pub session: Arc<SessionContext>,
    pub container: Arc<Container>,
    pub bus: Arc<EventBus>,
}

pub struct ToolDispatcher {
    registry: &'static ToolRegistry,
}

impl ToolDispatcher {
    pub fn new(registry: &'static ToolRegistry) -> Self {
        Self { registry }
    }

    /// Execute one tool call. The returned action drives what gets spoken.
    pub async fn dispatch(
        &self,
        context: &PluginContext,
        call: &ToolCallRequest,
    ) -> ActionResponse {
        let arguments: Value = serde_json::from_str(&call.arguments).unwrap_or(Value::Object(
            serde_json::Map::new(),
        ));

        if let Some(tool) = self.registry.get(&call.name) {
            tracing::debug!(
                session_id = %context.session.session_id,
                tool = %call.name,
                kind = ?tool.kind(),
                "dispatching tool"
            );
            return match tool.kind() {
                ToolKind::Mcp => self.dispatch_mcp(context, &call.name, arguments).await,
                _ => match tool.invoke(context, arguments).await {
                    Ok(response) => response,
                    Err(err) => {
                        tracing::error!(tool = %call.name, error = %err, "tool failed");
                        ActionResponse::error(err.to_string())
                    }
                },
            };
        }

        // Not in the server registry: maybe the device advertised it.
        if let Ok(mcp) = context
            .container
            .resolve_typed::<McpClient>("mcp_client", Some(&context.session.session_id))
        {
            if mcp.has_tool(&call.name) {
                return self
                    .call_device_tool(&mcp, &call.name, arguments)
                    .await;
            }
        }

        tracing::warn!(tool = %call.name, "tool not found");
        ActionResponse::not_found(format!("没有找到对应的工具：{}", call.name))
    }

    async fn dispatch_mcp(
        &self,
        context: &PluginContext,
        name: &str,
        arguments: Value,
    ) -> ActionResponse {
        match context
            .container
            .resolve_typed::<McpClient>("mcp_client", Some(&context.session.session_id))
        {
            Ok(mcp) => self.call_device_tool(&mcp, name, arguments).await,
            Err(_) => {
                tracing::warn!(tool = name, "device advertised no mcp channel");
                ActionResponse::error(ToolError::McpUnavailable.to_string())
            }
        }
    }

    async fn call_device_tool(
        &self,
        mcp: &McpClient,
        name: &str,
        arguments: Value,
    ) -> ActionResponse {
        match mcp.call_tool(name, arguments).await {
            Ok(result) => {
                // Text content feeds the LLM for a spoken summary.
                let text = result
                    .get("content")
                    .and_then(Value::as_array)
                    .map(|blocks| {
                        blocks
                            .iter()
                            .filter_map(|b| b.get("text").and_then(Value::as_str))
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| result.to_string());
                ActionResponse::req_llm(text)
            }
            Err(err) => {
                tracing::error!(tool = name, error = %err, "device tool failed");
                ActionResponse::error(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Tool;
    use crate::Action;
    use async_trait::async_trait;
    use voice_gateway_config::GatewayConfig;

    fn plugin_context() -> PluginContext {
        PluginContext {
            session: SessionContext::new("s1", None, None, None, false, GatewayConfig::default()),
            container: Arc::new(Container::new()),
            bus: Arc::new(EventBus::new()),
        }
    }

    struct SetPrompt;

    #[async_trait]
    impl Tool for SetPrompt {
        fn name(&self) -> &str {
            "change_role"
        }

        fn description(&self) -> &str {
            "switch the assistant persona"
        }

        fn kind(&self) -> ToolKind {
            ToolKind::ChangeSysPrompt
        }

        async fn invoke(
            &self,
            context: &PluginContext,
            arguments: Value,
        ) -> Result<ActionResponse, ToolError> {
            let prompt = arguments
                .get("prompt")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::Invocation("prompt argument missing".into()))?;
            context
                .session
                .dialogue
                .lock()
                .update_system_message(prompt);
            Ok(ActionResponse::response("角色已切换".to_string()))
        }
    }

    fn registry_with_set_prompt() -> &'static ToolRegistry {
        static REGISTRY: once_cell::sync::Lazy<ToolRegistry> = once_cell::sync::Lazy::new(|| {
            let registry = ToolRegistry::new();
            registry.register(Arc::new(SetPrompt));
            registry
        });
        &REGISTRY
    }

    #[tokio::test]
    async fn dispatch_runs_tool_with_context() {
        let dispatcher = ToolDispatcher::new(registry_with_set_prompt());
        let ctx = plugin_context();
        let call = ToolCallRequest {
            id: "c1".into(),
            name: "change_role".into(),
            arguments: r#"{"prompt": "你是一只猫"}"#.into(),
        };

        let response = dispatcher.dispatch(&ctx, &call).await;
        assert_eq!(response.action, Action::Response);
        let dialogue = ctx.session.dialogue.lock();
        assert_eq!(dialogue.snapshot()[0].content, "你是一只猫");
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let dispatcher = ToolDispatcher::new(registry_with_set_prompt());
        let ctx = plugin_context();
        let call = ToolCallRequest {
            id: "c1".into(),
            name: "no_such_tool".into(),
            arguments: "{}".into(),
        };

        let response = dispatcher.dispatch(&ctx, &call).await;
        assert_eq!(response.action, Action::NotFound);
    }

    #[tokio::test]
    async fn invocation_error_becomes_error_action() {
        let dispatcher = ToolDispatcher::new(registry_with_set_prompt());
        let ctx = plugin_context();
        let call = ToolCallRequest {
            id: "c1".into(),
            name: "change_role".into(),
            arguments: "{}".into(),
        };

        let response = dispatcher.dispatch(&ctx, &call).await;
        assert_eq!(response.action, Action::Error);
    }
}
