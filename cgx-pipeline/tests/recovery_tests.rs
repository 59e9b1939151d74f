//! Restart behaviour against an on-disk database

mod helpers;

use cgx_common::events::EventBus;
use cgx_pipeline::db;
use cgx_pipeline::models::{PipelineOptions, PipelineRun, RunState, RunStatus};
use helpers::*;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_solutions_survive_restart_and_interrupted_runs_fail() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("cgx.db");

    // First process: one finished run, one left mid-flight
    let pool = db::init_database_pool(&db_path).await.unwrap();
    let event_bus = EventBus::new(1000);
    let (export, vectors) = two_group_corpus();
    let coordinator = coordinator(&pool, &event_bus, MockEmbedder::new(vectors));

    let options = PipelineOptions {
        n_clusters: Some(2),
        ..test_options()
    };
    let solution = coordinator
        .run_pipeline(&export, options, CancellationToken::new())
        .await
        .unwrap();

    let mut stranded = PipelineRun::new(test_options());
    stranded.transition_to(RunState::Embedding);
    db::runs::save_run(&pool, &stranded).await.unwrap();

    pool.close().await;
    drop(pool);

    // Second process
    let pool = db::init_database_pool(&db_path).await.unwrap();
    assert_eq!(db::runs::fail_interrupted_runs(&pool).await.unwrap(), 1);

    let reloaded = db::runs::load_run(&pool, stranded.run_id).await.unwrap().unwrap();
    assert_eq!(reloaded.state, RunState::Failed);
    assert_eq!(reloaded.status, Some(RunStatus::Failed));
    assert!(reloaded.error_message.unwrap().contains("restart"));

    let latest = db::clusters::latest_solution(&pool).await.unwrap().unwrap();
    assert_eq!(latest.cluster_solution_id, solution.cluster_solution_id);
    assert_eq!(latest.random_seed, 7);
    assert_eq!(latest.clusters, solution.clusters);
    assert_eq!(latest.clusters[0].centroid_embedding.len(), 2);
}
