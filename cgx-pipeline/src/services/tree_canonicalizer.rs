//! Tree canonicalizer
//!
//! Turns a conversation's branching node mapping into one linear transcript:
//!
//! 1. Every node with a null `parent` is a root.
//! 2. From each root, follow `children[0]` until a leaf, collecting non-null messages.
//! 3. The chain with the most messages wins; ties go to the first root in export order.
//! 4. The winning chain is sorted by `create_time` (null = 0); the sort is stable.
//! 5. Only user/assistant messages are rendered.
//!
//! Malformed nodes surface as `CanonicalizeError` naming the node; the caller
//! decides whether to skip the conversation.

use crate::models::conversation::UNTITLED_CONVERSATION;
use crate::models::{CanonicalConversation, ConversationNode, NodeMapping, NodeMessage, Role, TranscriptMessage};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;

/// Separator between rendered messages
const MESSAGE_SEPARATOR: &str = "\n\n---\n";

/// Structural parse errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CanonicalizeError {
    #[error("conversation is not a JSON object")]
    NotAnObject,

    #[error("conversation has neither conversation_id nor id")]
    MissingConversationId,

    #[error("conversation {0}: mapping is missing or not an object")]
    MissingMapping(String),

    #[error("malformed node {node_id}: {reason}")]
    MalformedNode { node_id: String, reason: String },

    #[error("node {node_id} references missing child {child_id}")]
    DanglingChild { node_id: String, child_id: String },

    #[error("cycle detected at node {node_id}")]
    Cycle { node_id: String },
}

impl CanonicalizeError {
    fn malformed(node_id: &str, reason: impl Into<String>) -> Self {
        CanonicalizeError::MalformedNode {
            node_id: node_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Conversation that failed to canonicalize
#[derive(Debug, Clone)]
pub struct CanonicalizeFailure {
    /// Position in the export
    pub index: usize,
    pub conversation_id: Option<String>,
    pub error: CanonicalizeError,
}

impl CanonicalizeFailure {
    /// Id used in exclusion manifests
    pub fn display_id(&self) -> String {
        self.conversation_id
            .clone()
            .unwrap_or_else(|| format!("#{}", self.index))
    }
}

/// Result of canonicalizing a whole export
#[derive(Debug, Default)]
pub struct CanonicalizeOutcome {
    pub conversations: Vec<CanonicalConversation>,
    pub failures: Vec<CanonicalizeFailure>,
}

/// Canonicalize every conversation of an export
///
/// Failures are collected, never fatal to the others.
pub fn canonicalize(export: &[Value]) -> CanonicalizeOutcome {
    let mut outcome = CanonicalizeOutcome::default();

    for (index, raw) in export.iter().enumerate() {
        match canonicalize_conversation(raw) {
            Ok(conversation) => outcome.conversations.push(conversation),
            Err(error) => {
                let conversation_id = conversation_id_of(raw);
                tracing::warn!(
                    index,
                    conversation_id = ?conversation_id,
                    error = %error,
                    "Skipping conversation with malformed tree"
                );
                outcome.failures.push(CanonicalizeFailure {
                    index,
                    conversation_id,
                    error,
                });
            }
        }
    }

    outcome
}

/// Canonicalize one exported conversation
pub fn canonicalize_conversation(raw: &Value) -> Result<CanonicalConversation, CanonicalizeError> {
    let obj = raw.as_object().ok_or(CanonicalizeError::NotAnObject)?;
    let conversation_id = conversation_id_of(raw).ok_or(CanonicalizeError::MissingConversationId)?;

    let mapping_value = obj
        .get("mapping")
        .filter(|m| m.is_object())
        .ok_or_else(|| CanonicalizeError::MissingMapping(conversation_id.clone()))?;
    let mapping = parse_mapping(mapping_value)?;

    let chain = canonical_chain(&mapping)?;

    let raw_messages = Value::Array(chain.iter().map(|m| m.raw.clone()).collect());
    let messages: Vec<TranscriptMessage> = chain
        .iter()
        .filter(|m| m.author_role.is_conversational())
        .map(|m| TranscriptMessage {
            message_id: m.message_id.clone(),
            role: m.author_role.clone(),
            create_time: m.create_time,
            text: m.text().unwrap_or_default(),
        })
        .collect();
    let markdown = render_markdown(&messages);

    Ok(CanonicalConversation {
        conversation_id,
        title: obj
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or(UNTITLED_CONVERSATION)
            .to_string(),
        create_time: obj.get("create_time").and_then(Value::as_f64),
        update_time: obj.get("update_time").and_then(Value::as_f64),
        model_slug: obj
            .get("default_model_slug")
            .and_then(Value::as_str)
            .map(str::to_string),
        messages,
        markdown,
        raw_messages,
        summary: None,
        tags: None,
        embedding: None,
        umap_x: None,
        umap_y: None,
    })
}

/// `conversation_id`, falling back to the export's `id`
fn conversation_id_of(raw: &Value) -> Option<String> {
    ["conversation_id", "id"]
        .iter()
        .filter_map(|key| raw.get(key).and_then(Value::as_str))
        .find(|id| !id.is_empty())
        .map(str::to_string)
}

/// Parse the `mapping` object into a node arena, preserving export order
pub fn parse_mapping(value: &Value) -> Result<NodeMapping, CanonicalizeError> {
    let entries = value
        .as_object()
        .ok_or_else(|| CanonicalizeError::malformed("<mapping>", "mapping is not an object"))?;

    let mut mapping = NodeMapping::with_capacity(entries.len());
    for (node_id, node) in entries {
        mapping.insert(node_id.clone(), parse_node(node_id, node)?);
    }
    Ok(mapping)
}

fn parse_node(node_id: &str, value: &Value) -> Result<ConversationNode, CanonicalizeError> {
    let obj = value
        .as_object()
        .ok_or_else(|| CanonicalizeError::malformed(node_id, "node is not an object"))?;

    let parent_id = match required(obj, node_id, "parent")? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        _ => return Err(CanonicalizeError::malformed(node_id, "parent is not a string")),
    };

    let child_ids = required(obj, node_id, "children")?
        .as_array()
        .ok_or_else(|| CanonicalizeError::malformed(node_id, "children is not an array"))?
        .iter()
        .map(|c| {
            c.as_str()
                .map(str::to_string)
                .ok_or_else(|| CanonicalizeError::malformed(node_id, "child id is not a string"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let message = match required(obj, node_id, "message")? {
        Value::Null => None,
        m @ Value::Object(_) => Some(parse_message(node_id, m)?),
        _ => return Err(CanonicalizeError::malformed(node_id, "message is not an object")),
    };

    Ok(ConversationNode {
        node_id: node_id.to_string(),
        parent_id,
        child_ids,
        message,
    })
}

fn parse_message(node_id: &str, value: &Value) -> Result<NodeMessage, CanonicalizeError> {
    let role = value
        .get("author")
        .and_then(|a| a.get("role"))
        .and_then(Value::as_str)
        .ok_or_else(|| CanonicalizeError::malformed(node_id, "message has no author.role"))?;

    let create_time = match value.get("create_time") {
        None | Some(Value::Null) => None,
        Some(t) => Some(
            t.as_f64()
                .ok_or_else(|| CanonicalizeError::malformed(node_id, "create_time is not a number"))?,
        ),
    };

    Ok(NodeMessage {
        message_id: value.get("id").and_then(Value::as_str).map(str::to_string),
        author_role: Role::parse(role),
        create_time,
        content: value.get("content").cloned().unwrap_or(Value::Null),
        raw: value.clone(),
    })
}

fn required<'a>(obj: &'a Map<String, Value>, node_id: &str, key: &str) -> Result<&'a Value, CanonicalizeError> {
    obj.get(key)
        .ok_or_else(|| CanonicalizeError::malformed(node_id, format!("missing key '{}'", key)))
}

/// Longest first-child chain over all roots, sorted by `create_time`
///
/// A mapping without roots yields an empty chain.
pub fn canonical_chain(mapping: &NodeMapping) -> Result<Vec<&NodeMessage>, CanonicalizeError> {
    let mut best: Vec<&NodeMessage> = Vec::new();

    for root in mapping.values().filter(|n| n.is_root()) {
        let chain = first_child_chain(mapping, root)?;
        // Strictly greater keeps the first chain on ties
        if chain.len() > best.len() {
            best = chain;
        }
    }

    best.sort_by(|a, b| a.sort_time().total_cmp(&b.sort_time()));
    Ok(best)
}

fn first_child_chain<'a>(
    mapping: &'a NodeMapping,
    root: &'a ConversationNode,
) -> Result<Vec<&'a NodeMessage>, CanonicalizeError> {
    let mut chain = Vec::new();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut current = root;

    loop {
        if !visited.insert(current.node_id.as_str()) {
            return Err(CanonicalizeError::Cycle {
                node_id: current.node_id.clone(),
            });
        }

        if let Some(message) = &current.message {
            chain.push(message);
        }

        let Some(child_id) = current.child_ids.first() else {
            return Ok(chain);
        };
        current = mapping
            .get(child_id)
            .ok_or_else(|| CanonicalizeError::DanglingChild {
                node_id: current.node_id.clone(),
                child_id: child_id.clone(),
            })?;
    }
}

/// Render transcript messages as markdown
///
/// Each message is `# **Role:**\n<text>`; messages with blank text are omitted.
pub fn render_markdown(messages: &[TranscriptMessage]) -> String {
    messages
        .iter()
        .filter(|m| !m.text.trim().is_empty())
        .map(|m| format!("# **{}:**\n{}", m.role.capitalized(), m.text))
        .collect::<Vec<_>>()
        .join(MESSAGE_SEPARATOR)
}
