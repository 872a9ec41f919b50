//! Tests for the /health probe surface.

use axum::http::StatusCode;
use serde_json::json;
use std::sync::Arc;

use super::common::*;
use crate::services::graph_store::mock::MockGraphStore;

#[tokio::test]
async fn aggregate_health_reports_all_dependencies() {
    let registry = seeded_registry_dir();
    let state =
        build_state("{}", "ok", Arc::new(MockGraphStore::new()), &registry);

    let (status, body) = get_path(state, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["details"]["llm"], json!(true));
    assert_eq!(body["details"]["vlm"], json!(true));
    assert_eq!(body["details"]["graph"], json!(true));
}

#[tokio::test]
async fn aggregate_health_flags_down_dependency() {
    let registry = seeded_registry_dir();
    let state =
        build_state("{}", "ok", Arc::new(MockGraphStore::default()), &registry);

    let (status, body) = get_path(state, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(false));
    assert_eq!(body["details"]["graph"], json!(false));
}

#[tokio::test]
async fn per_dependency_probes_answer_individually() {
    let registry = seeded_registry_dir();
    let state =
        build_state("{}", "ok", Arc::new(MockGraphStore::new()), &registry);

    for path in ["/health/llm", "/health/vlm", "/health/graph"] {
        let (status, body) = get_path(Arc::clone(&state), path).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], json!(true), "{} should be healthy", path);
    }
}
