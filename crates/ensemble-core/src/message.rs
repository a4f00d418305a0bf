//! Chat message types exchanged with LLM providers

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }
}

/// Prepend `preamble` to the system message, inserting one when the
/// conversation has none. Used for the current-date-time enrichment.
pub fn with_system_preamble(messages: &[ChatMessage], preamble: &str) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    let mut seen_system = false;

    for msg in messages {
        if msg.is_system() && !seen_system {
            seen_system = true;
            if msg.content.contains(preamble) {
                out.push(msg.clone());
            } else {
                out.push(ChatMessage::system(format!("{}\n\n{}", msg.content, preamble)));
            }
        } else {
            out.push(msg.clone());
        }
    }

    if !seen_system {
        out.insert(0, ChatMessage::system(preamble.to_string()));
    }

    out
}
