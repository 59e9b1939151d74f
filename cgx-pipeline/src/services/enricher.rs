//! Enricher
//!
//! Two prompt modes share one `RequestOrchestrator`:
//! - summary/tags per conversation (transcript truncated to a character budget)
//! - title/description per cluster (centroid summaries plus the tag-count table)
//!
//! Failed items keep null fields; callers treat null tags as an empty set.

use crate::models::{CanonicalConversation, Cluster};
use crate::services::request_orchestrator::{
    parse_json, ItemOutcome, ProgressFn, Prompt, RequestOrchestrator, StructuredOutput,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

pub const MIN_TAGS: usize = 3;
pub const MAX_TAGS: usize = 5;

/// Appended after `...` when a transcript is cut
pub const TRUNCATION_MARKER: &str = "\n\n***conversation truncated***";

const SUMMARY_SYSTEM_PROMPT: &str = "You're an intelligent AI assistant who likes responding in JSON.

The user will provide you with a conversation between an AI chatbot and a user.
Your task is to briefly - in 1-2 sentences - summarize the main topics covered within the conversation.
You'll also provide a list of \"tags\" - these are keywords / short phrases that characterize the conversation.
Tags ought to be lowercase, and relevant to the conversation content. Include between 3-5 tags.";

const CLUSTER_SYSTEM_PROMPT: &str = "You're an intelligent AI assistant who likes responding in JSON.

The user will provide you with a list of conversation summaries from a cluster of related conversations.
Your task is to analyze these summaries and identify the common themes and topics that unite them.

You'll provide:
1. A brief, descriptive title for the cluster that captures its main theme
2. A 1-2 sentence description explaining what types of conversations are in this cluster and what unites them

Please ensure your response is concise but informative, focusing on the key patterns that emerge from the conversation cluster.";

/// Summary and tags for one conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub summary: String,
    pub tags: Vec<String>,
}

impl StructuredOutput for ConversationSummary {
    const SCHEMA_NAME: &'static str = "conversation_summary";

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "summary": {"type": "string", "description": "A 1-2 sentence summary of the conversation"},
                "tags": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "A list of tags that describe the conversation"
                }
            },
            "required": ["summary", "tags"],
            "additionalProperties": false
        })
    }

    /// Trims, lowercases and dedupes tags; requires a summary and 3-5 distinct tags
    fn parse(raw: &str) -> Result<Self, String> {
        let parsed: ConversationSummary = parse_json(raw)?;

        let summary = parsed.summary.trim().to_string();
        if summary.is_empty() {
            return Err("summary is empty".to_string());
        }

        let mut tags: Vec<String> = Vec::with_capacity(parsed.tags.len());
        for tag in parsed.tags.iter().map(|t| t.trim().to_lowercase()) {
            if !tag.is_empty() && !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        if !(MIN_TAGS..=MAX_TAGS).contains(&tags.len()) {
            return Err(format!(
                "expected {}-{} tags, got {}",
                MIN_TAGS,
                MAX_TAGS,
                tags.len()
            ));
        }

        Ok(Self { summary, tags })
    }
}

/// Title and description for one cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterLabel {
    pub title: String,
    pub description: String,
}

impl StructuredOutput for ClusterLabel {
    const SCHEMA_NAME: &'static str = "conversation_cluster_summary";

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string", "description": "A brief, human-readable title for the cluster."},
                "description": {"type": "string", "description": "A longer 1-2 sentence description of the cluster."}
            },
            "required": ["title", "description"],
            "additionalProperties": false
        })
    }

    fn parse(raw: &str) -> Result<Self, String> {
        let parsed: ClusterLabel = parse_json(raw)?;
        let title = parsed.title.trim().to_string();
        let description = parsed.description.trim().to_string();
        if title.is_empty() || description.is_empty() {
            return Err("title and description must be non-empty".to_string());
        }
        Ok(Self { title, description })
    }
}

/// Items an enrichment pass could not fill
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichmentReport {
    pub succeeded: usize,
    /// (conversation or cluster id, reason)
    pub failures: Vec<(String, String)>,
}

/// First `budget` characters of `text`, and whether anything was cut
pub fn truncate_chars(text: &str, budget: usize) -> (&str, bool) {
    match text.char_indices().nth(budget) {
        Some((byte_index, _)) => (&text[..byte_index], true),
        None => (text, false),
    }
}

/// Summary prompt for one transcript
pub fn summary_prompt(markdown: &str, budget: usize) -> Prompt {
    let (head, truncated) = truncate_chars(markdown, budget);
    let user = if truncated {
        format!("{}...{}", head, TRUNCATION_MARKER)
    } else {
        head.to_string()
    };

    Prompt {
        system: SUMMARY_SYSTEM_PROMPT.to_string(),
        user,
    }
}

/// Cluster-label prompt: example conversations, then tag counts as JSON
pub fn cluster_prompt(examples: &[(&str, &str)], tag_counts: &IndexMap<String, usize>) -> Prompt {
    let blocks: Vec<String> = examples
        .iter()
        .map(|(title, summary)| format!("**{}**\n\n{}", title, summary))
        .collect();
    let examples_markdown = format!("---\n\n{}\n\n---\n\n", blocks.join("\n\n---\n\n"));

    let user = format!(
        "# **Example Conversations:**\n\n{}\n\n# **Tag Counts:**\n\n```json\n{}\n```",
        examples_markdown,
        pretty_json(tag_counts)
    );

    Prompt {
        system: CLUSTER_SYSTEM_PROMPT.to_string(),
        user,
    }
}

/// JSON with four-space indentation
fn pretty_json<T: Serialize>(value: &T) -> String {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    if value.serialize(&mut serializer).is_err() {
        return "{}".to_string();
    }
    String::from_utf8(buf).unwrap_or_else(|_| "{}".to_string())
}

/// Summary/tag and cluster-label enrichment
pub struct Enricher {
    orchestrator: RequestOrchestrator,
    max_chars_per_context: usize,
}

impl Enricher {
    pub fn new(orchestrator: RequestOrchestrator, max_chars_per_context: usize) -> Self {
        Self {
            orchestrator,
            max_chars_per_context,
        }
    }

    /// Fill `summary` and `tags` in place; failures leave them null
    pub async fn enrich_summaries(
        &self,
        conversations: &mut [CanonicalConversation],
        cancel_token: &CancellationToken,
        progress: Option<&ProgressFn<'_>>,
    ) -> EnrichmentReport {
        let prompts = conversations
            .iter()
            .map(|c| summary_prompt(&c.markdown, self.max_chars_per_context))
            .collect();

        let outcomes = self
            .orchestrator
            .run::<ConversationSummary>(prompts, cancel_token, progress)
            .await;

        let mut report = EnrichmentReport::default();
        for (conversation, outcome) in conversations.iter_mut().zip(outcomes) {
            if let Some(reason) = outcome.failure_reason() {
                report.failures.push((conversation.conversation_id.clone(), reason));
            }
            if let ItemOutcome::Done(result) = outcome {
                conversation.summary = Some(result.summary);
                conversation.tags = Some(result.tags);
                report.succeeded += 1;
            }
        }

        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failures.len(),
            "Summary enrichment finished"
        );
        report
    }

    /// Fill `cluster_label` and `cluster_description` in place
    ///
    /// Example conversations are the cluster's centroid conversations, nearest first.
    pub async fn label_clusters(
        &self,
        clusters: &mut [Cluster],
        conversations: &[CanonicalConversation],
        cancel_token: &CancellationToken,
        progress: Option<&ProgressFn<'_>>,
    ) -> EnrichmentReport {
        let prompts: Vec<Prompt> = {
            let by_id: HashMap<&str, &CanonicalConversation> = conversations
                .iter()
                .map(|c| (c.conversation_id.as_str(), c))
                .collect();

            clusters
                .iter()
                .map(|cluster| {
                    let examples: Vec<(&str, &str)> = cluster
                        .centroid_conversation_ids
                        .iter()
                        .filter_map(|id| by_id.get(id.as_str()))
                        .map(|c| (c.title.as_str(), c.summary.as_deref().unwrap_or("")))
                        .collect();
                    cluster_prompt(&examples, &cluster.tag_counts)
                })
                .collect()
        };

        let outcomes = self
            .orchestrator
            .run::<ClusterLabel>(prompts, cancel_token, progress)
            .await;

        let mut report = EnrichmentReport::default();
        for (cluster, outcome) in clusters.iter_mut().zip(outcomes) {
            if let Some(reason) = outcome.failure_reason() {
                report.failures.push((cluster.cluster_id.clone(), reason));
            }
            if let ItemOutcome::Done(label) = outcome {
                cluster.cluster_label = Some(label.title);
                cluster.cluster_description = Some(label.description);
                report.succeeded += 1;
            }
        }

        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failures.len(),
            "Cluster labeling finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_parse_normalizes_tags() {
        let raw = r#"{"summary": " Talks about Rust. ", "tags": [" Rust ", "ASYNC", "tokio"]}"#;
        let parsed = ConversationSummary::parse(raw).unwrap();

        assert_eq!(parsed.summary, "Talks about Rust.");
        assert_eq!(parsed.tags, vec!["rust", "async", "tokio"]);
    }

    #[test]
    fn test_summary_parse_dedupes_tags_before_counting() {
        let raw = r#"{"summary": "s", "tags": ["Rust", "rust ", "async", "tokio"]}"#;
        assert_eq!(ConversationSummary::parse(raw).unwrap().tags, vec!["rust", "async", "tokio"]);

        let repeated = r#"{"summary": "s", "tags": ["a", "A", "b"]}"#;
        assert!(ConversationSummary::parse(repeated).is_err());
    }

    #[test]
    fn test_summary_parse_rejects_bad_tag_counts() {
        let too_few = r#"{"summary": "s", "tags": ["a", "b"]}"#;
        let too_many = r#"{"summary": "s", "tags": ["a", "b", "c", "d", "e", "f"]}"#;
        let blank_summary = r#"{"summary": "  ", "tags": ["a", "b", "c"]}"#;

        assert!(ConversationSummary::parse(too_few).is_err());
        assert!(ConversationSummary::parse(too_many).is_err());
        assert!(ConversationSummary::parse(blank_summary).is_err());
        assert!(ConversationSummary::parse("nope").is_err());
    }

    #[test]
    fn test_truncation_is_char_safe() {
        assert_eq!(truncate_chars("héllo", 2), ("hé", true));
        assert_eq!(truncate_chars("abc", 3), ("abc", false));
        assert_eq!(truncate_chars("", 0), ("", false));
    }

    #[test]
    fn test_summary_prompt_marks_truncation() {
        let prompt = summary_prompt("abcdefgh", 4);
        assert_eq!(prompt.user, format!("abcd...{}", TRUNCATION_MARKER));

        let short = summary_prompt("abc", 4);
        assert_eq!(short.user, "abc");
        assert!(short.system.contains("3-5 tags"));
    }

    #[test]
    fn test_cluster_prompt_layout() {
        let mut tags = IndexMap::new();
        tags.insert("rust".to_string(), 3);

        let prompt = cluster_prompt(&[("First", "About A."), ("Second", "About B.")], &tags);

        assert!(prompt.user.starts_with(
            "# **Example Conversations:**\n\n---\n\n**First**\n\nAbout A.\n\n---\n\n**Second**\n\nAbout B.\n\n---\n\n"
        ));
        assert!(prompt
            .user
            .ends_with("# **Tag Counts:**\n\n```json\n{\n    \"rust\": 3\n}\n```"));
    }

    #[test]
    fn test_cluster_label_requires_both_fields() {
        assert!(ClusterLabel::parse(r#"{"title": "T", "description": ""}"#).is_err());
        let ok = ClusterLabel::parse(r#"{"title": " T ", "description": "D"}"#).unwrap();
        assert_eq!(ok.title, "T");
    }
}
