//! Shared fixtures for integration tests: canned LLM/VLM backends, a
//! seeded dummy registry and a router harness over the mock graph store.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use tower::ServiceExt;

use crate::config::Config;
use crate::services::graph_store::mock::MockGraphStore;
use crate::services::llm_runner::{LlmGeneration, LlmService};
use crate::services::vlm_runner::{VlmGeneration, VlmService, VlmTask};
use crate::services::DummyRegistry;
use crate::utils::ApiResult;
use crate::{AppState, create_router};

pub struct CannedLlm {
    pub output: String,
}

#[async_trait]
impl LlmService for CannedLlm {
    async fn generate(&self, _prompt: &str, _temperature: f64) -> LlmGeneration {
        LlmGeneration {
            output: self.output.clone(),
            model: "test-llm".to_string(),
            latency_ms: 3,
            warning: None,
        }
    }

    async fn health(&self) -> bool {
        true
    }

    fn model(&self) -> &str {
        "test-llm"
    }
}

pub struct CannedVlm {
    pub output: String,
}

#[async_trait]
impl VlmService for CannedVlm {
    async fn generate(
        &self,
        _image_bytes: &[u8],
        _prompt: &str,
        _task: VlmTask,
        _temperature: f64,
    ) -> ApiResult<VlmGeneration> {
        Ok(VlmGeneration {
            output: self.output.clone(),
            model: "test-vlm".to_string(),
            latency_ms: 5,
            raw: serde_json::json!({}),
        })
    }

    async fn health(&self) -> bool {
        true
    }

    fn model(&self) -> &str {
        "test-vlm"
    }
}

/// Registry directory seeding IMG_001 with one nodule finding.
pub fn seeded_registry_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut imaging = std::fs::File::create(dir.path().join("imaging.csv")).unwrap();
    writeln!(imaging, "id,file_path,modality").unwrap();
    writeln!(imaging, "IMG_001,/mnt/data/medical_dummy/images/img_001.png,XR").unwrap();
    let mut findings = std::fs::File::create(dir.path().join("findings.csv")).unwrap();
    writeln!(findings, "image_id,finding_id,type,location,size_cm,conf").unwrap();
    writeln!(findings, "IMG_001,f_seed01,Nodule,Right middle lobe,1.2,0.85").unwrap();
    dir
}

pub fn empty_registry_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("tempdir")
}

pub fn build_state(
    vlm_output: &str,
    llm_output: &str,
    store: Arc<MockGraphStore>,
    registry_dir: &tempfile::TempDir,
) -> Arc<AppState> {
    let registry = DummyRegistry::load(registry_dir.path()).expect("registry loads");
    Arc::new(AppState {
        config: Config::default(),
        llm: Arc::new(CannedLlm { output: llm_output.to_string() }),
        vlm: Arc::new(CannedVlm { output: vlm_output.to_string() }),
        graph: store,
        registry: Arc::new(registry),
    })
}

/// Register the read-side responses a seeded analyze run needs.
pub fn respond_graph_reads(store: &MockGraphStore) {
    store.respond(
        "UNWIND combined AS row",
        vec![serde_json::json!({ "rel": "HAS_FINDING", "cnt": 1, "avg_conf": 0.85 })],
    );
    store.respond(
        "collect({type:f.type",
        vec![serde_json::json!({
            "image_id": "IMG_001",
            "findings": [{
                "id": "f_seed01",
                "type": "Nodule",
                "location": "Right middle lobe",
                "size_cm": 1.2,
                "conf": 0.85,
            }],
        })],
    );
    store.respond(
        "RETURN f.id AS finding_id",
        vec![serde_json::json!({
            "finding_id": "f_seed01",
            "type": "Nodule",
            "anatomy": "Right middle lobe",
            "score": 0.82,
        })],
    );
}

/// Register an upsert receipt.
pub fn respond_upsert(store: &MockGraphStore, finding_ids: &[&str]) {
    store.respond(
        "MERGE (c:Case",
        vec![serde_json::json!({ "image_id": "IMG_001", "finding_ids": finding_ids })],
    );
}

/// Full happy-path graph: seeded reads plus a receipt echoing the finding.
pub fn respond_happy_graph(store: &MockGraphStore) {
    respond_upsert(store, &["f_seed01"]);
    respond_graph_reads(store);
}

pub async fn post_analyze(
    state: Arc<AppState>,
    query: &str,
    body: Value,
) -> (StatusCode, Value) {
    let app = create_router(state);
    let request = Request::builder()
        .method("POST")
        .uri(format!("/pipeline/analyze{}", query))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request builds");
    let response = app.oneshot(request).await.expect("router responds");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body reads");
    let value: Value =
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::new()));
    (status, value)
}

pub async fn get_path(state: Arc<AppState>, path: &str) -> (StatusCode, Value) {
    let app = create_router(state);
    let request = Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .expect("request builds");
    let response = app.oneshot(request).await.expect("router responds");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body reads");
    let value: Value =
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::new()));
    (status, value)
}

/// Write an image fixture with the given file name; returns the full path.
pub fn image_fixture(dir: &tempfile::TempDir, name: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, b"\x89PNG\r\n\x1a\nfixture").expect("fixture writes");
    path.display().to_string()
}
