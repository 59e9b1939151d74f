//! HTTP surface tests driven through the router with `oneshot`

mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use cgx_pipeline::build_router;
use helpers::*;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    send(
        app,
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

async fn wait_for_terminal(app: &Router, run_id: &str) -> Value {
    for _ in 0..200 {
        let (status, run) = get(app, &format!("/pipeline/runs/{}", run_id)).await;
        assert_eq!(status, StatusCode::OK);
        if matches!(run["state"].as_str(), Some("COMPLETED" | "FAILED" | "CANCELLED")) {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("run {} did not finish", run_id);
}

#[tokio::test]
async fn test_health_reports_module() {
    let app = build_router(test_app_state(MockEmbedder::new(HashMap::new())).await);

    let (status, body) = get(&app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "cgx-pipeline");
    assert!(body.get("last_error").is_none());
}

#[tokio::test]
async fn test_clusters_404_before_any_run() {
    let app = build_router(test_app_state(MockEmbedder::new(HashMap::new())).await);

    let (status, body) = get(&app, "/clusters").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, body) = get(&app, "/cluster-solutions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, body) = get(&app, "/conversations").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["conversations"], json!([]));

    let (status, body) = get(&app, "/has-data").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!(false));
}

#[tokio::test]
async fn test_start_run_validates_request() {
    let app = build_router(test_app_state(MockEmbedder::new(HashMap::new())).await);

    let (status, _) = post_json(&app, "/pipeline/runs", json!({"export": []})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = post_json(
        &app,
        "/pipeline/runs",
        json!({"export": [{"id": "x", "mapping": {}}], "options": {"max_parallel_requests": 0}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("max_parallel_requests"));
}

#[tokio::test]
async fn test_run_lifecycle_over_http() {
    let (export, vectors) = two_group_corpus();
    let app = build_router(test_app_state(MockEmbedder::new(vectors)).await);

    let (status, body) = post_json(
        &app,
        "/pipeline/runs",
        json!({"export": export, "options": {"n_clusters": 2}}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["conversation_count"], 10);
    let run_id = body["run_id"].as_str().unwrap().to_string();

    let run = wait_for_terminal(&app, &run_id).await;
    assert_eq!(run["state"], "COMPLETED");
    assert_eq!(run["status"], "SUCCESS");
    assert_eq!(run["options"]["random_seed"], 7);
    let solution_id = run["cluster_solution_id"].as_str().unwrap().to_string();

    let (status, latest) = get(&app, "/clusters").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(latest["cluster_solution_id"], solution_id.as_str());
    let clusters = latest["clusters"].as_array().unwrap();
    assert_eq!(clusters.len(), 2);
    assert!(clusters.iter().all(|c| c["cluster_size"] == 5));
    assert!(clusters.iter().all(|c| c.get("centroid_embedding").is_none()));

    let (status, by_id) = get(&app, &format!("/clusters/{}", solution_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(by_id["n_clusters"], 2);

    let (_, solutions) = get(&app, "/cluster-solutions").await;
    assert_eq!(solutions.as_array().unwrap().len(), 1);

    let (status, points) = get(&app, &format!("/conversations?solution_id={}", solution_id)).await;
    assert_eq!(status, StatusCode::OK);
    let rows = points["conversations"].as_array().unwrap();
    assert_eq!(rows.len(), 10);
    assert!(rows.iter().all(|r| r["cluster_id"].is_string() && r["umap_x"].is_number()));

    let (status, has_data) = get(&app, "/has-data").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(has_data, json!(true));

    // Token is released just after the final run row is written
    let mut health_status = Value::Null;
    for _ in 0..40 {
        let (_, health) = get(&app, "/health").await;
        health_status = health["status"].clone();
        if health_status == "ok" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(health_status, "ok");
}

#[tokio::test]
async fn test_second_run_conflicts_while_one_is_active() {
    let state = test_app_state(MockEmbedder::new(HashMap::new())).await;
    let active = Uuid::new_v4();
    state
        .cancellation_tokens
        .write()
        .await
        .insert(active, CancellationToken::new());
    let app = build_router(state);

    let (export, _) = two_group_corpus();
    let (status, body) = post_json(&app, "/pipeline/runs", json!({"export": export})).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"]["message"].as_str().unwrap().contains(&active.to_string()));
}

#[tokio::test]
async fn test_failed_run_is_reported() {
    let (export, vectors) = two_group_corpus();
    let state = test_app_state(MockEmbedder::new(vectors)).await;
    let app = build_router(state);

    let (status, body) = post_json(
        &app,
        "/pipeline/runs",
        json!({"export": export, "options": {"n_clusters": 50}}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let run = wait_for_terminal(&app, body["run_id"].as_str().unwrap()).await;
    assert_eq!(run["state"], "FAILED");
    assert!(run["cluster_solution_id"].is_null());

    let (status, _) = get(&app, "/clusters").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // last_error is written after the run row; give the task a moment
    let mut last_error = Value::Null;
    for _ in 0..40 {
        let (_, health) = get(&app, "/health").await;
        last_error = health["last_error"].clone();
        if last_error.is_string() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(last_error.as_str().unwrap().contains("Clustering"));
}

#[tokio::test]
async fn test_unknown_ids_are_404() {
    let app = build_router(test_app_state(MockEmbedder::new(HashMap::new())).await);
    let missing = Uuid::new_v4();

    let (status, _) = get(&app, &format!("/pipeline/runs/{}", missing)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post_json(&app, &format!("/pipeline/runs/{}/cancel", missing), json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get(&app, "/clusters/kmeans_2_nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get(&app, "/conversations?solution_id=kmeans_2_nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_finished_run_is_rejected() {
    let (export, vectors) = two_group_corpus();
    let app = build_router(test_app_state(MockEmbedder::new(vectors)).await);

    let (_, body) = post_json(&app, "/pipeline/runs", json!({"export": export})).await;
    let run_id = body["run_id"].as_str().unwrap().to_string();
    wait_for_terminal(&app, &run_id).await;

    // The token may outlive the row update briefly
    let mut status = StatusCode::OK;
    for _ in 0..40 {
        status = post_json(&app, &format!("/pipeline/runs/{}/cancel", run_id), json!({})).await.0;
        if status == StatusCode::BAD_REQUEST {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
