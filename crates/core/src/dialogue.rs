//! Dialogue history
//!
//! The ordered message list that becomes the LLM prompt suffix. The system
//! message is rebuilt in place when configuration changes; everything else
//! is append-only within a session.

use serde::{Deserialize, Serialize};

use crate::events::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub timestamp_ms: u64,
}

impl DialogueMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            timestamp_ms: now_ms(),
        }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            timestamp_ms: now_ms(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Dialogue {
    messages: Vec<DialogueMessage>,
}

impl Dialogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, message: DialogueMessage) {
        self.messages.push(message);
    }

    /// Replace the system message, inserting one at the front if absent.
    pub fn update_system_message(&mut self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        match self.messages.iter_mut().find(|m| m.role == Role::System) {
            Some(system) => system.content = prompt,
            None => self
                .messages
                .insert(0, DialogueMessage::new(Role::System, prompt)),
        }
    }

    /// Copy of the full history, taken under the caller's lock.
    pub fn snapshot(&self) -> Vec<DialogueMessage> {
        self.messages.clone()
    }

    pub fn last(&self) -> Option<&DialogueMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_message_is_rebuilt_in_place() {
        let mut dialogue = Dialogue::new();
        dialogue.put(DialogueMessage::new(Role::User, "hi"));
        dialogue.update_system_message("v1");
        dialogue.update_system_message("v2");

        let snapshot = dialogue.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].role, Role::System);
        assert_eq!(snapshot[0].content, "v2");
        assert_eq!(snapshot[1].content, "hi");
    }

    #[test]
    fn tool_messages_carry_call_ids() {
        let message = DialogueMessage::tool("result", "call-1");
        assert_eq!(message.role, Role::Tool);
        assert_eq!(message.tool_call_id.as_deref(), Some("call-1"));
    }
}
