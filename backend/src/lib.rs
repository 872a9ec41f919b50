//! grounded-ai backend: multi-modal medical-image reasoning orchestrator.
//!
//! Chains a vision-language model, a property-graph store and a text LLM
//! into a single `/pipeline/analyze` endpoint with consensus scoring and
//! auditable provenance.

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod utils;

#[cfg(test)]
mod tests;

pub use config::Config;

use services::{DummyRegistry, GraphStore, LlmService, VlmService};

/// Shared service instances; request handlers see this behind an Arc.
pub struct AppState {
    pub config: Config,
    pub llm: Arc<dyn LlmService>,
    pub vlm: Arc<dyn VlmService>,
    pub graph: Arc<dyn GraphStore>,
    pub registry: Arc<DummyRegistry>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::pipeline::analyze,
        handlers::health::health_root,
        handlers::health::health_llm,
        handlers::health::health_vlm,
        handlers::health::health_graph,
    ),
    components(schemas(
        models::AnalyzeRequest,
        models::AnalyzeResponse,
        models::AnalyzeParameters,
        models::ConsensusResult,
        models::ContextBundle,
        models::EvaluationPayload,
        models::FallbackMeta,
        handlers::health::HealthResponse,
        handlers::health::ProbeResponse,
    )),
    tags(
        (name = "Pipeline", description = "Multi-modal analyze pipeline"),
        (name = "Health", description = "Dependency health probes"),
    )
)]
pub struct ApiDoc;

/// Build the application router with all routes and middleware.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/pipeline/analyze", post(handlers::pipeline::analyze))
        .route("/health", get(handlers::health::health_root))
        .route("/health/llm", get(handlers::health::health_llm))
        .route("/health/vlm", get(handlers::health::health_vlm))
        .route("/health/graph", get(handlers::health::health_graph))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
