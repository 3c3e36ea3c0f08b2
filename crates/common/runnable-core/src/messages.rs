//! Minimal chat message types exchanged by the model and parser units.

use serde::{Deserialize, Serialize};

/// A complete message produced by a chat model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AIMessage {
    /// The message content.
    pub content: String,
    /// Optional unique identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl AIMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A piece of a message emitted while a model streams.
///
/// Chunks serialize to the same shape as [`AIMessage`], so aggregating
/// streamed chunks in JSON yields the full message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AIMessageChunk {
    pub content: String,
}

impl AIMessageChunk {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }

    /// Append `other` to this chunk.
    pub fn concat(mut self, other: &AIMessageChunk) -> Self {
        self.content.push_str(&other.content);
        self
    }
}

impl From<AIMessageChunk> for AIMessage {
    fn from(chunk: AIMessageChunk) -> Self {
        AIMessage::new(chunk.content)
    }
}
