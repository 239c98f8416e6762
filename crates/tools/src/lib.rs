//! Tool invocation layer
//!
//! Tools are registered once at startup in a process-wide registry and
//! dispatched per session with a [`PluginContext`] that grants access to the
//! session context, the container and the event bus. Device-side tools
//! negotiated over `hello` are reached through the [`mcp::McpClient`].

pub mod action;
pub mod dispatcher;
pub mod mcp;
pub mod registry;

pub use action::{Action, ActionResponse};
pub use dispatcher::{PluginContext, ToolDispatcher};
pub use mcp::McpClient;
pub use registry::{global_registry, Tool, ToolKind, ToolRegistry};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("tool '{0}' is not registered")]
    NotFound(String),

    #[error("tool failed: {0}")]
    Invocation(String),

    #[error("tool timed out")]
    Timeout,

    #[error("device mcp channel unavailable")]
    McpUnavailable,
}
