//! Device-side MCP channel
//!
//! Devices that advertise `features.mcp` in `hello` expose tools over the
//! control connection as JSON-RPC wrapped in `{"type":"mcp","payload":…}`
//! frames. The client keeps a pending-request map keyed by request id; the
//! router feeds device replies back through [`McpClient::handle_payload`].

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use voice_gateway_llm::ToolDefinition;
use voice_gateway_transport::Transport;

use crate::ToolError;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct McpClient {
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<i64, oneshot::Sender<Value>>>,
    next_id: AtomicI64,
    tools: RwLock<Vec<ToolDefinition>>,
}

impl McpClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            tools: RwLock::new(Vec::new()),
        }
    }

    /// Send `initialize` followed by `tools/list`; called right after the
    /// device advertises the capability.
    pub async fn initialize(&self) -> Result<(), ToolError> {
        self.send_request(
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "voice-gateway", "version": env!("CARGO_PKG_VERSION") }
            }),
        )
        .await?;
        let listed = self.send_request("tools/list", json!({})).await?;
        if let Some(tools) = listed.get("tools").and_then(Value::as_array) {
            let defs = tools
                .iter()
                .filter_map(|t| {
                    Some(ToolDefinition {
                        name: t.get("name")?.as_str()?.to_string(),
                        description: t
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        parameters: t
                            .get("inputSchema")
                            .cloned()
                            .unwrap_or_else(|| json!({ "type": "object" })),
                    })
                })
                .collect::<Vec<_>>();
            tracing::info!(count = defs.len(), "device mcp tools listed");
            *self.tools.write() = defs;
        }
        Ok(())
    }

    /// Tools the device advertised, merged into the dialogue tool list.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.read().clone()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.read().iter().any(|t| t.name == name)
    }

    /// Invoke one device tool and wait for its reply.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        self.send_request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let envelope = json!({
            "type": "mcp",
            "payload": { "jsonrpc": "2.0", "id": id, "method": method, "params": params }
        });
        if self.transport.send_json(&envelope).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(ToolError::McpUnavailable);
        }

        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(ToolError::McpUnavailable),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(ToolError::Timeout)
            }
        }
    }

    /// Route a device `mcp` payload to its waiting request.
    pub fn handle_payload(&self, payload: &Value) {
        let Some(id) = payload.get("id").and_then(Value::as_i64) else {
            tracing::debug!("mcp notification without id ignored");
            return;
        };
        let Some(waiter) = self.pending.lock().remove(&id) else {
            tracing::debug!(id, "mcp reply matched no pending request");
            return;
        };
        let outcome = if let Some(error) = payload.get("error") {
            json!({ "error": error })
        } else {
            payload.get("result").cloned().unwrap_or(Value::Null)
        };
        let _ = waiter.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use voice_gateway_transport::{Frame, TransportError};

    /// Captures outbound JSON and lets the test inject replies.
    struct LoopbackTransport {
        sent: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn send_text(&self, text: &str) -> Result<(), TransportError> {
            self.sent.lock().push(serde_json::from_str(text).unwrap());
            Ok(())
        }

        async fn send_binary(&self, _data: &[u8]) -> Result<(), TransportError> {
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

    #[tokio::test]
    async fn call_tool_resolves_on_reply() {
        let transport = Arc::new(LoopbackTransport {
            sent: Mutex::new(Vec::new()),
        });
        let client = Arc::new(McpClient::new(transport.clone()));

        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.call_tool("self.dog.bark", json!({})).await })
        };

        // Wait until the request hit the wire, then answer it.
        let id = loop {
            if let Some(msg) = transport.sent.lock().first() {
                break msg["payload"]["id"].as_i64().unwrap();
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        };
        client.handle_payload(&json!({
            "jsonrpc": "2.0", "id": id, "result": { "content": [{ "type": "text", "text": "woof" }] }
        }));

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["content"][0]["text"], "woof");
    }

    #[tokio::test]
    async fn unknown_reply_id_is_ignored() {
        let transport = Arc::new(LoopbackTransport {
            sent: Mutex::new(Vec::new()),
        });
        let client = McpClient::new(transport);
        client.handle_payload(&json!({ "jsonrpc": "2.0", "id": 99, "result": {} }));
    }

    #[tokio::test]
    async fn tools_list_populates_definitions() {
        let transport = Arc::new(LoopbackTransport {
            sent: Mutex::new(Vec::new()),
        });
        let client = Arc::new(McpClient::new(transport.clone()));

        let init = {
            let client = client.clone();
            tokio::spawn(async move { client.initialize().await })
        };

        // Answer initialize, then tools/list, in request order.
        let mut answered = 0;
        while answered < 2 {
            let next = {
                let sent = transport.sent.lock();
                sent.get(answered).map(|m| {
                    (
                        m["payload"]["id"].as_i64().unwrap(),
                        m["payload"]["method"].as_str().unwrap().to_string(),
                    )
                })
            };
            if let Some((id, method)) = next {
                let result = if method == "tools/list" {
                    json!({ "tools": [{ "name": "self.light.on", "description": "turn on", "inputSchema": { "type": "object" } }] })
                } else {
                    json!({})
                };
                client.handle_payload(&json!({ "jsonrpc": "2.0", "id": id, "result": result }));
                answered += 1;
            } else {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        init.await.unwrap().unwrap();
        assert!(client.has_tool("self.light.on"));
        assert_eq!(client.tool_definitions().len(), 1);
    }
}
