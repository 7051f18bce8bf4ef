//! Conversation inputs handed to every source client.

use serde::{Deserialize, Serialize};

use crate::ids::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// The prompt and prior turns shared by every source of one request.
///
/// Clients receive it by reference; the aggregator wraps it in an `Arc` so
/// every worker thread sees the same allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRequest {
    pub request_id: RequestId,
    pub prompt: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
}

impl SourceRequest {
    pub fn new(prompt: impl Into<String>, history: Vec<ChatMessage>) -> Self {
        Self {
            request_id: RequestId::default(),
            prompt: prompt.into(),
            history,
        }
    }
}
