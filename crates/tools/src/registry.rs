//! Process-wide tool registry
//!
//! Populated during startup, sealed before the first connection is
//! accepted, read-only afterwards. Late registrations are refused.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use voice_gateway_llm::ToolDefinition;

use crate::dispatcher::PluginContext;
use crate::{ActionResponse, ToolError};

/// How a tool is invoked and what it may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// Side-effect-free; safe to run inline.
    Wait,
    /// Controls server-side session behavior.
    SystemCtl,
    /// Controls device peripherals via IoT descriptors.
    IotCtl,
    /// Rewrites the dialogue's system message.
    ChangeSysPrompt,
    /// Forwarded to the device's MCP channel.
    Mcp,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn kind(&self) -> ToolKind;

    /// Schema handed to the dialogue LLM.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: serde_json::json!({ "type": "object", "properties": {} }),
        }
    }

    async fn invoke(
        &self,
        context: &PluginContext,
        arguments: Value,
    ) -> Result<ActionResponse, ToolError>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    sealed: AtomicBool,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        if self.sealed.load(Ordering::Acquire) {
            tracing::warn!(tool = tool.name(), "registry sealed, registration refused");
            return;
        }
        let name = tool.name().to_string();
        self.tools.write().insert(name.clone(), tool);
        tracing::debug!(tool = %name, "tool registered");
    }

    /// Freeze the registry; called once startup wiring is done.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Definitions of every registered tool, for the LLM tool list.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.read().values().map(|t| t.definition()).collect()
    }
}

static GLOBAL: Lazy<ToolRegistry> = Lazy::new(ToolRegistry::new);

pub fn global_registry() -> &'static ToolRegistry {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "repeats its input"
        }

        fn kind(&self) -> ToolKind {
            ToolKind::Wait
        }

        async fn invoke(
            &self,
            _context: &PluginContext,
            arguments: Value,
        ) -> Result<ActionResponse, ToolError> {
            Ok(ActionResponse::response(arguments.to_string()))
        }
    }

    #[test]
    fn register_lookup_and_definitions() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        assert!(registry.has("echo"));
        assert_eq!(registry.len(), 1);

        let defs = registry.definitions();
        assert_eq!(defs[0].name, "echo");
    }

    #[test]
    fn sealed_registry_refuses_registration() {
        let registry = ToolRegistry::new();
        registry.seal();
        registry.register(Arc::new(Echo));
        assert!(registry.is_empty());
    }
}
