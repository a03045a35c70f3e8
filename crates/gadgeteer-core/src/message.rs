//! Conversation message types

use serde::{Deserialize, Serialize};

/// Role of a conversation message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message in the conversation. Immutable once appended to history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Message content - plain text or an ordered list of parts
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

/// Content part types
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "image")]
    Image { media_type: String, data: String },

    #[serde(rename = "audio")]
    Audio { media_type: String, data: String },

    #[serde(rename = "gadget_use")]
    GadgetUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "gadget_result")]
    GadgetResult {
        invocation_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

impl Message {
    pub fn system(content: impl Into<Content>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn user(content: impl Into<Content>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn assistant(content: impl Into<Content>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            metadata: None,
        }
    }

    /// A user-role message carrying a single gadget result part.
    pub fn gadget_result(invocation_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::User,
            content: Content::Parts(vec![ContentPart::GadgetResult {
                invocation_id: invocation_id.into(),
                content: content.into(),
                is_error: if is_error { Some(true) } else { None },
            }]),
            metadata: None,
        }
    }

    /// Total character length of the textual content, used for token estimation.
    pub fn char_len(&self) -> usize {
        match &self.content {
            Content::Text(s) => s.len(),
            Content::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::Image { data, .. } | ContentPart::Audio { data, .. } => data.len(),
                    ContentPart::GadgetUse { name, input, .. } => {
                        name.len() + input.to_string().len()
                    }
                    ContentPart::GadgetResult { content, .. } => content.len(),
                })
                .sum(),
        }
    }

    /// Flatten the content to plain text. Non-text parts contribute their
    /// textual payload only.
    pub fn text(&self) -> String {
        match &self.content {
            Content::Text(s) => s.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.clone()),
                    ContentPart::GadgetResult { content, .. } => Some(content.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Whether this message carries a gadget result part.
    pub fn is_gadget_result(&self) -> bool {
        match &self.content {
            Content::Parts(parts) => parts
                .iter()
                .any(|p| matches!(p, ContentPart::GadgetResult { .. })),
            Content::Text(_) => false,
        }
    }
}
