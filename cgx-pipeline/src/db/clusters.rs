//! Cluster solution persistence
//!
//! A solution, its clusters and its per-conversation assignments are written in
//! one transaction: readers see either the whole solution or none of it.

use cgx_common::{Error, Result};
use chrono::SecondsFormat;
use indexmap::IndexMap;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{from_json, parse_timestamp, to_json, MAX_LOCK_WAIT_MS};
use crate::models::{Cluster, ClusterSolution, ClusterSolutionSummary, ConversationPoint};
use crate::utils::{decode_vector, encode_vector, retry_on_lock};

/// Write a complete solution atomically
pub async fn save_solution(pool: &SqlitePool, solution: &ClusterSolution, points: &[ConversationPoint]) -> Result<()> {
    retry_on_lock("save_solution", MAX_LOCK_WAIT_MS, || async {
        write_solution(pool, solution, points).await
    })
    .await?;

    tracing::info!(
        cluster_solution_id = %solution.cluster_solution_id,
        n_clusters = solution.n_clusters,
        conversations = points.len(),
        "Cluster solution committed"
    );
    Ok(())
}

async fn write_solution(pool: &SqlitePool, solution: &ClusterSolution, points: &[ConversationPoint]) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO cluster_solutions (
            cluster_solution_id, algorithm, n_clusters, random_seed,
            embedding_dim, run_id, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&solution.cluster_solution_id)
    .bind(&solution.algorithm)
    .bind(solution.n_clusters as i64)
    // u64 seeds are stored bit-for-bit in SQLite's signed INTEGER
    .bind(solution.random_seed as i64)
    .bind(solution.embedding_dim as i64)
    .bind(solution.run_id.map(|id| id.to_string()))
    .bind(solution.created_at.to_rfc3339_opts(SecondsFormat::Micros, true))
    .execute(&mut *tx)
    .await?;

    for cluster in &solution.clusters {
        sqlx::query(
            r#"
            INSERT INTO clusters (
                cluster_solution_id, cluster_id, member_conversation_ids,
                centroid_conversation_ids, centroid_embedding, cluster_size,
                cluster_label, cluster_description, tag_counts,
                mean_cosine_similarity, cluster_radius, silhouette_score,
                centroid_umap_x, centroid_umap_y
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&solution.cluster_solution_id)
        .bind(&cluster.cluster_id)
        .bind(to_json(&cluster.member_conversation_ids, "member ids")?)
        .bind(to_json(&cluster.centroid_conversation_ids, "centroid ids")?)
        .bind(encode_vector(&cluster.centroid_embedding))
        .bind(cluster.cluster_size() as i64)
        .bind(&cluster.cluster_label)
        .bind(&cluster.cluster_description)
        .bind(to_json(&cluster.tag_counts, "tag counts")?)
        .bind(cluster.mean_cosine_similarity)
        .bind(cluster.cluster_radius)
        .bind(cluster.silhouette_score)
        .bind(cluster.centroid_umap_x)
        .bind(cluster.centroid_umap_y)
        .execute(&mut *tx)
        .await?;
    }

    for point in points {
        let cluster_id = point.cluster_id.as_deref().ok_or_else(|| {
            Error::InvalidInput(format!("conversation {} has no cluster", point.conversation_id))
        })?;

        sqlx::query(
            r#"
            INSERT INTO cluster_assignments (
                cluster_solution_id, conversation_id, cluster_id, umap_x, umap_y
            ) VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&solution.cluster_solution_id)
        .bind(&point.conversation_id)
        .bind(cluster_id)
        .bind(point.umap_x)
        .bind(point.umap_y)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE conversations SET umap_x = ?, umap_y = ? WHERE conversation_id = ?")
            .bind(point.umap_x)
            .bind(point.umap_y)
            .bind(&point.conversation_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Most recently created solution
pub async fn latest_solution(pool: &SqlitePool) -> Result<Option<ClusterSolution>> {
    let id: Option<String> = sqlx::query_scalar(
        "SELECT cluster_solution_id FROM cluster_solutions ORDER BY created_at DESC, rowid DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;

    match id {
        Some(id) => load_solution(pool, &id).await,
        None => Ok(None),
    }
}

pub async fn load_solution(pool: &SqlitePool, cluster_solution_id: &str) -> Result<Option<ClusterSolution>> {
    let row = sqlx::query(
        r#"
        SELECT cluster_solution_id, algorithm, n_clusters, random_seed,
               embedding_dim, run_id, created_at
        FROM cluster_solutions
        WHERE cluster_solution_id = ?
        "#,
    )
    .bind(cluster_solution_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let summary = summary_from_row(&row)?;

    let rows = sqlx::query(
        r#"
        SELECT cluster_id, member_conversation_ids, centroid_conversation_ids,
               centroid_embedding, cluster_label, cluster_description, tag_counts,
               mean_cosine_similarity, cluster_radius, silhouette_score,
               centroid_umap_x, centroid_umap_y
        FROM clusters
        WHERE cluster_solution_id = ?
        ORDER BY cluster_id
        "#,
    )
    .bind(cluster_solution_id)
    .fetch_all(pool)
    .await?;

    let clusters = rows
        .iter()
        .map(|row| cluster_from_row(row, summary.embedding_dim))
        .collect::<Result<Vec<_>>>()?;

    Ok(Some(ClusterSolution {
        cluster_solution_id: summary.cluster_solution_id,
        algorithm: summary.algorithm,
        n_clusters: summary.n_clusters,
        random_seed: summary.random_seed,
        embedding_dim: summary.embedding_dim,
        run_id: summary.run_id,
        created_at: summary.created_at,
        clusters,
    }))
}

/// All solutions, newest first
pub async fn list_solutions(pool: &SqlitePool) -> Result<Vec<ClusterSolutionSummary>> {
    let rows = sqlx::query(
        r#"
        SELECT cluster_solution_id, algorithm, n_clusters, random_seed,
               embedding_dim, run_id, created_at
        FROM cluster_solutions
        ORDER BY created_at DESC, rowid DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(summary_from_row).collect()
}

/// Scatter-plot rows for one solution
pub async fn conversation_points(pool: &SqlitePool, cluster_solution_id: &str) -> Result<Vec<ConversationPoint>> {
    let rows = sqlx::query(
        r#"
        SELECT a.conversation_id, c.title, a.cluster_id, a.umap_x, a.umap_y
        FROM cluster_assignments a
        JOIN conversations c ON c.conversation_id = a.conversation_id
        WHERE a.cluster_solution_id = ?
        ORDER BY a.conversation_id
        "#,
    )
    .bind(cluster_solution_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> Result<ConversationPoint> {
            Ok(ConversationPoint {
                conversation_id: row.try_get("conversation_id")?,
                title: row.try_get("title")?,
                cluster_id: row.try_get("cluster_id")?,
                umap_x: row.try_get("umap_x")?,
                umap_y: row.try_get("umap_y")?,
            })
        })
        .collect()
}

fn summary_from_row(row: &SqliteRow) -> Result<ClusterSolutionSummary> {
    let run_id: Option<String> = row.try_get("run_id")?;
    let run_id = run_id
        .map(|s| Uuid::parse_str(&s))
        .transpose()
        .map_err(|e| Error::Internal(format!("Failed to parse run_id: {}", e)))?;
    let created_at: String = row.try_get("created_at")?;

    Ok(ClusterSolutionSummary {
        cluster_solution_id: row.try_get("cluster_solution_id")?,
        algorithm: row.try_get("algorithm")?,
        n_clusters: row.try_get::<i64, _>("n_clusters")? as usize,
        random_seed: row.try_get::<i64, _>("random_seed")? as u64,
        embedding_dim: row.try_get::<i64, _>("embedding_dim")? as usize,
        run_id,
        created_at: parse_timestamp(&created_at, "created_at")?,
    })
}

fn cluster_from_row(row: &SqliteRow, embedding_dim: usize) -> Result<Cluster> {
    let cluster_id: String = row.try_get("cluster_id")?;
    let members: String = row.try_get("member_conversation_ids")?;
    let centroid_ids: String = row.try_get("centroid_conversation_ids")?;
    let centroid: Vec<u8> = row.try_get("centroid_embedding")?;
    let tag_counts: String = row.try_get("tag_counts")?;

    let centroid_embedding = decode_vector(&centroid, embedding_dim)
        .map_err(|e| Error::Internal(format!("{}: {}", cluster_id, e)))?;
    let tag_counts: IndexMap<String, usize> = from_json(&tag_counts, "tag counts")?;

    Ok(Cluster {
        member_conversation_ids: from_json(&members, "member ids")?,
        centroid_conversation_ids: from_json(&centroid_ids, "centroid ids")?,
        centroid_embedding,
        tag_counts,
        mean_cosine_similarity: row.try_get("mean_cosine_similarity")?,
        cluster_radius: row.try_get("cluster_radius")?,
        silhouette_score: row.try_get("silhouette_score")?,
        centroid_umap_x: row.try_get("centroid_umap_x")?,
        centroid_umap_y: row.try_get("centroid_umap_y")?,
        cluster_label: row.try_get("cluster_label")?,
        cluster_description: row.try_get("cluster_description")?,
        cluster_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_pool;
    use crate::models::cluster::{new_solution_id, KMEANS_ALGORITHM};
    use chrono::{Duration, Utc};

    fn cluster(id: &str, members: &[&str]) -> Cluster {
        Cluster {
            cluster_id: id.to_string(),
            member_conversation_ids: members.iter().map(|m| m.to_string()).collect(),
            centroid_conversation_ids: members.iter().take(1).map(|m| m.to_string()).collect(),
            centroid_embedding: vec![0.5, -0.5],
            tag_counts: IndexMap::from([("rust".to_string(), 2), ("async".to_string(), 1)]),
            mean_cosine_similarity: 0.9,
            cluster_radius: 1.25,
            silhouette_score: 0.4,
            centroid_umap_x: Some(1.0),
            centroid_umap_y: Some(2.0),
            cluster_label: Some("Rust".to_string()),
            cluster_description: None,
        }
    }

    fn solution(clusters: Vec<Cluster>, age_seconds: i64) -> ClusterSolution {
        let created_at = Utc::now() - Duration::seconds(age_seconds);
        ClusterSolution {
            cluster_solution_id: new_solution_id(clusters.len(), created_at),
            algorithm: KMEANS_ALGORITHM.to_string(),
            n_clusters: clusters.len(),
            random_seed: u64::MAX,
            embedding_dim: 2,
            run_id: Some(Uuid::new_v4()),
            created_at,
            clusters,
        }
    }

    fn point(id: &str, cluster_id: &str) -> ConversationPoint {
        ConversationPoint {
            conversation_id: id.to_string(),
            title: String::new(),
            cluster_id: Some(cluster_id.to_string()),
            umap_x: Some(0.0),
            umap_y: Some(1.0),
        }
    }

    #[tokio::test]
    async fn test_solution_round_trip() {
        let pool = init_memory_pool().await.unwrap();
        let saved = solution(vec![cluster("cluster_0", &["a", "b"]), cluster("cluster_1", &["c"])], 0);

        save_solution(&pool, &saved, &[]).await.unwrap();
        let loaded = load_solution(&pool, &saved.cluster_solution_id).await.unwrap().unwrap();

        assert_eq!(loaded.random_seed, u64::MAX);
        assert_eq!(loaded.created_at.timestamp(), saved.created_at.timestamp());
        assert_eq!(loaded.clusters, saved.clusters);
        // Tag order survives the JSON column
        assert_eq!(loaded.clusters[0].tag_counts.keys().next().map(String::as_str), Some("rust"));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_solution() {
        let pool = init_memory_pool().await.unwrap();
        // Duplicate cluster ids violate the primary key halfway through the write
        let broken = solution(vec![cluster("cluster_0", &["a"]), cluster("cluster_0", &["b"])], 0);

        assert!(save_solution(&pool, &broken, &[]).await.is_err());

        assert!(load_solution(&pool, &broken.cluster_solution_id).await.unwrap().is_none());
        assert!(latest_solution(&pool).await.unwrap().is_none());
        let orphans: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM clusters")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn test_latest_and_listing_are_newest_first() {
        let pool = init_memory_pool().await.unwrap();
        let older = solution(vec![cluster("cluster_0", &["a"])], 60);
        let newer = solution(vec![cluster("cluster_0", &["a"]), cluster("cluster_1", &["b"])], 0);

        save_solution(&pool, &older, &[]).await.unwrap();
        save_solution(&pool, &newer, &[]).await.unwrap();

        let latest = latest_solution(&pool).await.unwrap().unwrap();
        assert_eq!(latest.cluster_solution_id, newer.cluster_solution_id);

        let listed: Vec<String> = list_solutions(&pool)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.cluster_solution_id)
            .collect();
        assert_eq!(listed, vec![newer.cluster_solution_id, older.cluster_solution_id]);
    }

    #[tokio::test]
    async fn test_points_without_cluster_abort_the_write() {
        let pool = init_memory_pool().await.unwrap();
        let saved = solution(vec![cluster("cluster_0", &["a"])], 0);
        let mut unassigned = point("a", "cluster_0");
        unassigned.cluster_id = None;

        assert!(save_solution(&pool, &saved, &[unassigned]).await.is_err());
        assert!(list_solutions(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conversation_points_join_titles() {
        let pool = init_memory_pool().await.unwrap();
        sqlx::query(
            "INSERT INTO conversations (conversation_id, title, raw_messages_data, messages, messages_markdown, updated_at)
             VALUES ('a', 'First', '[]', '[]', '', '')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let saved = solution(vec![cluster("cluster_0", &["a"])], 0);
        save_solution(&pool, &saved, &[point("a", "cluster_0")]).await.unwrap();

        let points = conversation_points(&pool, &saved.cluster_solution_id).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].title, "First");
        assert_eq!(points[0].cluster_id.as_deref(), Some("cluster_0"));
        assert_eq!(points[0].umap_y, Some(1.0));
    }
}
