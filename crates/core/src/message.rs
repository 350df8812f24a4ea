//! Chat message model used for token estimation and history rendering.
//!
//! Messages come out of session documents, so the role is an open string
//! and content may be plain text or multi-part (vision payloads carry
//! text parts alongside binary parts the estimator ignores).

use serde::{Deserialize, Serialize};

/// A single chat message with a role and content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,

    #[serde(default)]
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: MessageContent::Text(content.into()),
        }
    }

    /// Flatten the content to plain text (multi-part text joined by newlines).
    pub fn text(&self) -> String {
        self.content.to_text()
    }
}

/// Message content — plain text or a list of parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<MessagePart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    pub fn to_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// One part of a multi-part message. Non-text parts deserialize with
/// `text: None` and contribute nothing to estimates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_content_deserializes() {
        let msg: ChatMessage =
            serde_json::from_str(r#"{"role":"user","content":"hello"}"#).unwrap();
        assert_eq!(msg.text(), "hello");
    }

    #[test]
    fn multipart_content_deserializes() {
        let msg: ChatMessage = serde_json::from_str(
            r#"{"role":"user","content":[{"type":"text","text":"part one"},{"type":"image"},{"type":"text","text":"part two"}]}"#,
        )
        .unwrap();
        assert_eq!(msg.text(), "part one\npart two");
    }
}
