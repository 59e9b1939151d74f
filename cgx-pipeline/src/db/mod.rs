//! Database access for cgx-pipeline
//!
//! SQLite file `cgx.db` in the root folder. Conversation enrichment is written
//! row by row as stages finish; a cluster solution is written in one transaction.

pub mod clusters;
pub mod conversations;
pub mod runs;

use cgx_common::{Error, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;

/// How long a write keeps retrying while SQLite reports lock contention
pub const MAX_LOCK_WAIT_MS: u64 = 5000;

/// Open (creating if needed) the database file and its tables
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // mode=rwc: read, write, create
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    create_tables(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database (each connection would otherwise see its own)
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    create_tables(&pool).await?;
    Ok(pool)
}

pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            conversation_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            create_time REAL,
            update_time REAL,
            model_slug TEXT,
            raw_messages_data TEXT NOT NULL,
            messages TEXT NOT NULL,
            messages_markdown TEXT NOT NULL,
            summary TEXT,
            tags TEXT,
            embedding BLOB,
            umap_x REAL,
            umap_y REAL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cluster_solutions (
            cluster_solution_id TEXT PRIMARY KEY,
            algorithm TEXT NOT NULL,
            n_clusters INTEGER NOT NULL,
            random_seed INTEGER NOT NULL,
            embedding_dim INTEGER NOT NULL,
            run_id TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS clusters (
            cluster_solution_id TEXT NOT NULL
                REFERENCES cluster_solutions(cluster_solution_id) ON DELETE CASCADE,
            cluster_id TEXT NOT NULL,
            member_conversation_ids TEXT NOT NULL,
            centroid_conversation_ids TEXT NOT NULL,
            centroid_embedding BLOB NOT NULL,
            cluster_size INTEGER NOT NULL,
            cluster_label TEXT,
            cluster_description TEXT,
            tag_counts TEXT NOT NULL,
            mean_cosine_similarity REAL NOT NULL,
            cluster_radius REAL NOT NULL,
            silhouette_score REAL NOT NULL,
            centroid_umap_x REAL,
            centroid_umap_y REAL,
            PRIMARY KEY (cluster_solution_id, cluster_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-solution assignment and layout; conversations.umap_x/y hold the latest only
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cluster_assignments (
            cluster_solution_id TEXT NOT NULL
                REFERENCES cluster_solutions(cluster_solution_id) ON DELETE CASCADE,
            conversation_id TEXT NOT NULL,
            cluster_id TEXT NOT NULL,
            umap_x REAL,
            umap_y REAL,
            PRIMARY KEY (cluster_solution_id, conversation_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_runs (
            run_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            status TEXT,
            options TEXT NOT NULL,
            progress TEXT NOT NULL,
            counts TEXT NOT NULL,
            exclusions TEXT NOT NULL,
            cluster_solution_id TEXT,
            error_message TEXT,
            started_at TEXT NOT NULL,
            ended_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Internal(format!("Failed to serialize {}: {}", what, e)))
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(text: &str, what: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| Error::Internal(format!("Failed to deserialize {}: {}", what, e)))
}

pub(crate) fn parse_timestamp(text: &str, what: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", what, e)))
}
