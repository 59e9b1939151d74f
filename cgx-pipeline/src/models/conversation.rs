//! Conversation data model
//!
//! The export's branching node mapping is held as an arena (`IndexMap` from node id
//! to `ConversationNode`) with child-id lists; canonicalization reads it without
//! building linked objects. `CanonicalConversation` is the durable, per-conversation
//! output that later stages enrich in place.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Placeholder title for conversations exported without one
pub const UNTITLED_CONVERSATION: &str = "UNTITLED CONVERSATION";

/// Author role of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
    Other(String),
}

impl From<String> for Role {
    fn from(role: String) -> Self {
        Role::parse(&role)
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl Role {
    pub fn parse(role: &str) -> Self {
        match role {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "system" => Role::System,
            "tool" => Role::Tool,
            other => Role::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
            Role::Other(s) => s,
        }
    }

    /// Only user and assistant messages make it into the transcript
    pub fn is_conversational(&self) -> bool {
        matches!(self, Role::User | Role::Assistant)
    }

    /// Role name with the first letter upper-cased ("user" → "User")
    pub fn capitalized(&self) -> String {
        let mut chars = self.as_str().chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
            None => String::new(),
        }
    }
}

/// Message payload of a conversation node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMessage {
    pub message_id: Option<String>,
    pub author_role: Role,
    /// Seconds since the epoch; null in some exports
    pub create_time: Option<f64>,
    /// Raw `content` object (`content_type` + `parts` / `text`)
    pub content: serde_json::Value,
    /// The message exactly as exported, kept for `raw_messages_data`
    pub raw: serde_json::Value,
}

impl NodeMessage {
    /// Sort key: null timestamps sort as 0
    pub fn sort_time(&self) -> f64 {
        self.create_time.unwrap_or(0.0)
    }

    /// Plain text of the message by content type
    ///
    /// - `text`: parts joined by a single space
    /// - `code`: the `text` field
    /// - `multimodal_text`: string parts kept, anything else becomes an image marker
    ///
    /// Returns `None` for any other content type.
    pub fn text(&self) -> Option<String> {
        let content_type = self.content.get("content_type")?.as_str()?;
        let parts = || {
            self.content
                .get("parts")
                .and_then(|p| p.as_array())
                .cloned()
                .unwrap_or_default()
        };

        match content_type {
            "text" => Some(
                parts()
                    .iter()
                    .map(|p| p.as_str().map(str::to_string).unwrap_or_else(|| p.to_string()))
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            "code" => self
                .content
                .get("text")
                .and_then(|t| t.as_str())
                .map(str::to_string),
            "multimodal_text" => Some(
                parts()
                    .iter()
                    .map(|p| match p.as_str() {
                        Some(s) => s.to_string(),
                        None => "\n[IMAGE OMITTED]\n".to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            _ => None,
        }
    }
}

/// One node of a conversation tree
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationNode {
    pub node_id: String,
    pub parent_id: Option<String>,
    pub child_ids: Vec<String>,
    pub message: Option<NodeMessage>,
}

impl ConversationNode {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.child_ids.is_empty()
    }
}

/// Node arena keyed by node id, in export order
pub type NodeMapping = IndexMap<String, ConversationNode>;

/// Message of a canonical transcript (user/assistant only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub message_id: Option<String>,
    pub role: Role,
    pub create_time: Option<f64>,
    pub text: String,
}

/// Canonical linear transcript of one conversation plus its enrichment fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalConversation {
    pub conversation_id: String,
    pub title: String,
    pub create_time: Option<f64>,
    pub update_time: Option<f64>,
    pub model_slug: Option<String>,

    /// Sorted, role-filtered messages
    pub messages: Vec<TranscriptMessage>,

    /// Markdown rendering of `messages`
    pub markdown: String,

    /// The full sorted chain (all roles) as exported
    pub raw_messages: serde_json::Value,

    // Enrichment, filled by later stages
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub umap_x: Option<f32>,
    #[serde(default)]
    pub umap_y: Option<f32>,
}

impl CanonicalConversation {
    /// Tags with null treated as an empty set
    pub fn tags_or_empty(&self) -> &[String] {
        self.tags.as_deref().unwrap_or(&[])
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}
