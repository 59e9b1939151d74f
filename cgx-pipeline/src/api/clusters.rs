//! Cluster solution read API
//!
//! GET /clusters, GET /clusters/:solution_id, GET /cluster-solutions,
//! GET /conversations?solution_id=, GET /has-data

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    db::clusters,
    error::{ApiError, ApiResult},
    models::{Cluster, ClusterSolution, ClusterSolutionSummary, ConversationPoint},
    AppState,
};

/// One cluster as served to the front end
#[derive(Debug, Serialize)]
pub struct ClusterView {
    #[serde(flatten)]
    pub cluster: Cluster,
    pub cluster_size: usize,
}

/// A solution with its clusters
#[derive(Debug, Serialize)]
pub struct SolutionResponse {
    #[serde(flatten)]
    pub solution: ClusterSolutionSummary,
    pub clusters: Vec<ClusterView>,
}

impl From<ClusterSolution> for SolutionResponse {
    fn from(solution: ClusterSolution) -> Self {
        let summary = solution.summary();
        let clusters = solution
            .clusters
            .into_iter()
            .map(|cluster| ClusterView {
                cluster_size: cluster.cluster_size(),
                cluster,
            })
            .collect();

        Self {
            solution: summary,
            clusters,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConversationsQuery {
    /// Defaults to the latest solution
    pub solution_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConversationsResponse {
    pub cluster_solution_id: Option<String>,
    pub conversations: Vec<ConversationPoint>,
}

/// GET /clusters
///
/// Latest solution. 404 until a run has completed.
pub async fn latest_clusters(State(state): State<AppState>) -> ApiResult<Json<SolutionResponse>> {
    let solution = clusters::latest_solution(&state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound("No cluster solution has been computed".to_string()))?;

    Ok(Json(solution.into()))
}

/// GET /clusters/:solution_id
pub async fn solution_clusters(
    State(state): State<AppState>,
    Path(solution_id): Path<String>,
) -> ApiResult<Json<SolutionResponse>> {
    let solution = clusters::load_solution(&state.db, &solution_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Cluster solution not found: {}", solution_id)))?;

    Ok(Json(solution.into()))
}

/// GET /cluster-solutions
///
/// Every solution, newest first.
pub async fn list_cluster_solutions(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<ClusterSolutionSummary>>> {
    Ok(Json(clusters::list_solutions(&state.db).await?))
}

/// GET /conversations?solution_id=
///
/// Scatter-plot rows. With no solution on record the list is empty.
pub async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<ConversationsQuery>,
) -> ApiResult<Json<ConversationsResponse>> {
    let solutions = clusters::list_solutions(&state.db).await?;

    let solution_id = match query.solution_id {
        Some(id) => {
            if !solutions.iter().any(|s| s.cluster_solution_id == id) {
                return Err(ApiError::NotFound(format!("Cluster solution not found: {}", id)));
            }
            Some(id)
        }
        None => solutions.into_iter().next().map(|s| s.cluster_solution_id),
    };

    let conversations = match &solution_id {
        Some(id) => clusters::conversation_points(&state.db, id).await?,
        None => Vec::new(),
    };

    Ok(Json(ConversationsResponse {
        cluster_solution_id: solution_id,
        conversations,
    }))
}

/// GET /has-data
///
/// Whether any conversation has been stored yet.
pub async fn has_data(State(state): State<AppState>) -> ApiResult<Json<bool>> {
    let count = crate::db::conversations::count_conversations(&state.db).await?;
    tracing::debug!(count, "Conversation data check");
    Ok(Json(count > 0))
}

/// Build cluster read routes
pub fn cluster_routes() -> Router<AppState> {
    Router::new()
        .route("/clusters", get(latest_clusters))
        .route("/clusters/:solution_id", get(solution_clusters))
        .route("/cluster-solutions", get(list_cluster_solutions))
        .route("/conversations", get(list_conversations))
        .route("/has-data", get(has_data))
}
