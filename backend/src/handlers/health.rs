//! Service health probes aggregated under /health.

use axum::{Json, extract::State};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::AppState;

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub ok: bool,
    pub services: Vec<String>,
    pub version: String,
    pub details: BTreeMap<String, bool>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ProbeResponse {
    pub ok: bool,
}

fn app_version() -> String {
    std::env::var("APP_VERSION")
        .or_else(|_| std::env::var("GIT_SHA"))
        .unwrap_or_else(|_| "dev".to_string())
}

async fn collect_status(state: &AppState) -> BTreeMap<String, bool> {
    let (llm, vlm, graph) =
        tokio::join!(state.llm.health(), state.vlm.health(), state.graph.health());
    BTreeMap::from([
        ("llm".to_string(), llm),
        ("vlm".to_string(), vlm),
        ("graph".to_string(), graph),
    ])
}

/// GET /health
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Aggregate dependency health", body = HealthResponse)),
    tag = "Health"
)]
pub async fn health_root(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let details = collect_status(&state).await;
    Json(HealthResponse {
        ok: details.values().all(|up| *up),
        services: details.keys().cloned().collect(),
        version: app_version(),
        details,
    })
}

/// GET /health/llm
#[utoipa::path(
    get,
    path = "/health/llm",
    responses((status = 200, description = "LLM runner health", body = ProbeResponse)),
    tag = "Health"
)]
pub async fn health_llm(State(state): State<Arc<AppState>>) -> Json<ProbeResponse> {
    Json(ProbeResponse { ok: state.llm.health().await })
}

/// GET /health/vlm
#[utoipa::path(
    get,
    path = "/health/vlm",
    responses((status = 200, description = "VLM runner health", body = ProbeResponse)),
    tag = "Health"
)]
pub async fn health_vlm(State(state): State<Arc<AppState>>) -> Json<ProbeResponse> {
    Json(ProbeResponse { ok: state.vlm.health().await })
}

/// GET /health/graph
#[utoipa::path(
    get,
    path = "/health/graph",
    responses((status = 200, description = "Graph store health", body = ProbeResponse)),
    tag = "Health"
)]
pub async fn health_graph(State(state): State<Arc<AppState>>) -> Json<ProbeResponse> {
    Json(ProbeResponse { ok: state.graph.health().await })
}
