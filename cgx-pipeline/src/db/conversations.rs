//! Conversation rows
//!
//! Every write here touches one row and is independent of the others, so stages
//! can persist results as they complete.

use cgx_common::{Error, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use super::{from_json, to_json, MAX_LOCK_WAIT_MS};
use crate::models::{CanonicalConversation, TranscriptMessage};
use crate::utils::{decode_vector, encode_vector, retry_on_lock};

/// Insert or refresh a canonical transcript
///
/// Enrichment columns are reset; they belong to the run that is about to
/// recompute them.
pub async fn upsert_conversation(pool: &SqlitePool, conversation: &CanonicalConversation) -> Result<()> {
    let messages = to_json(&conversation.messages, "messages")?;
    let raw_messages = to_json(&conversation.raw_messages, "raw messages")?;
    let updated_at = Utc::now().to_rfc3339();

    retry_on_lock("upsert_conversation", MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            INSERT INTO conversations (
                conversation_id, title, create_time, update_time, model_slug,
                raw_messages_data, messages, messages_markdown, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(conversation_id) DO UPDATE SET
                title = excluded.title,
                create_time = excluded.create_time,
                update_time = excluded.update_time,
                model_slug = excluded.model_slug,
                raw_messages_data = excluded.raw_messages_data,
                messages = excluded.messages,
                messages_markdown = excluded.messages_markdown,
                summary = NULL,
                tags = NULL,
                embedding = NULL,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&conversation.conversation_id)
        .bind(&conversation.title)
        .bind(conversation.create_time)
        .bind(conversation.update_time)
        .bind(&conversation.model_slug)
        .bind(&raw_messages)
        .bind(&messages)
        .bind(&conversation.markdown)
        .bind(&updated_at)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}

pub async fn update_enrichment(
    pool: &SqlitePool,
    conversation_id: &str,
    summary: Option<&str>,
    tags: Option<&[String]>,
) -> Result<()> {
    let tags = tags.map(|t| to_json(&t, "tags")).transpose()?;
    let updated_at = Utc::now().to_rfc3339();

    retry_on_lock("update_enrichment", MAX_LOCK_WAIT_MS, || async {
        sqlx::query("UPDATE conversations SET summary = ?, tags = ?, updated_at = ? WHERE conversation_id = ?")
            .bind(summary)
            .bind(&tags)
            .bind(&updated_at)
            .bind(conversation_id)
            .execute(pool)
            .await?;
        Ok(())
    })
    .await
}

pub async fn update_embedding(pool: &SqlitePool, conversation_id: &str, embedding: &[f32]) -> Result<()> {
    let blob = encode_vector(embedding);
    let updated_at = Utc::now().to_rfc3339();

    retry_on_lock("update_embedding", MAX_LOCK_WAIT_MS, || async {
        sqlx::query("UPDATE conversations SET embedding = ?, updated_at = ? WHERE conversation_id = ?")
            .bind(&blob)
            .bind(&updated_at)
            .bind(conversation_id)
            .execute(pool)
            .await?;
        Ok(())
    })
    .await
}

/// Load one conversation
///
/// The embedding is decoded only when `embedding_dim` is known; vectors are
/// stored without their length.
pub async fn load_conversation(
    pool: &SqlitePool,
    conversation_id: &str,
    embedding_dim: Option<usize>,
) -> Result<Option<CanonicalConversation>> {
    let row = sqlx::query(
        r#"
        SELECT conversation_id, title, create_time, update_time, model_slug,
               raw_messages_data, messages, messages_markdown, summary, tags,
               embedding, umap_x, umap_y
        FROM conversations
        WHERE conversation_id = ?
        "#,
    )
    .bind(conversation_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let messages: String = row.try_get("messages")?;
    let messages: Vec<TranscriptMessage> = from_json(&messages, "messages")?;
    let raw_messages: String = row.try_get("raw_messages_data")?;
    let tags: Option<String> = row.try_get("tags")?;
    let embedding: Option<Vec<u8>> = row.try_get("embedding")?;

    let embedding = match (embedding, embedding_dim) {
        (Some(blob), Some(dim)) => {
            Some(decode_vector(&blob, dim).map_err(|e| Error::Internal(format!("{}: {}", conversation_id, e)))?)
        }
        _ => None,
    };

    Ok(Some(CanonicalConversation {
        conversation_id: row.try_get("conversation_id")?,
        title: row.try_get("title")?,
        create_time: row.try_get("create_time")?,
        update_time: row.try_get("update_time")?,
        model_slug: row.try_get("model_slug")?,
        messages,
        markdown: row.try_get("messages_markdown")?,
        raw_messages: from_json(&raw_messages, "raw messages")?,
        summary: row.try_get("summary")?,
        tags: tags.map(|t| from_json(&t, "tags")).transpose()?,
        embedding,
        umap_x: row.try_get("umap_x")?,
        umap_y: row.try_get("umap_y")?,
    }))
}

pub async fn count_conversations(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
