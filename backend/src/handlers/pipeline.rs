//! One-shot orchestration endpoint that chains VLM -> graph -> LLM.
//!
//! POST /pipeline/analyze runs the full per-request pipeline: normalise,
//! resolve identity, upsert the case subgraph, build the graph context,
//! run the requested reasoning modes and compute the consensus answer.

use axum::{
    Json,
    extract::{Query, State},
};
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use validator::Validate;

use crate::AppState;
use crate::models::{
    AnalyzeRequest, AnalyzeResponse, ConsensusStatus, ContextBundle, Degraded,
    EvaluationConsensus, EvaluationPayload, EvidencePath, FactFinding, FallbackMeta,
    FindingRecord, Mode, ModeOutput, ModeResults, ProvenancePayload, SimilarImage, Slot,
    Timings,
};
use crate::services::consensus::{
    ConsensusOptions, compute_consensus, jaccard_similarity, normalise_for_consensus,
};
use crate::services::context_pack::{
    BundleOptions, GraphContextBuilder, SlotOverrides, ensure_findings_slot_allocation,
};
use crate::services::debug_payload::DebugPayloadBuilder;
use crate::services::dedup::dedup_findings;
use crate::services::fallback_meta::FallbackMetaGuard;
use crate::services::graph_repo::{CaseUpsert, GraphRepo};
use crate::services::image_identity::{IdentityPayload, ImageIdSource, identify_image};
use crate::services::modes::{run_v_mode, run_vgl_mode, run_vl_mode};
use crate::services::normalizer::{NormalizeOptions, normalize_from_vlm};
use crate::services::safety::{apply_organ_guard, infer_expected_organ};
use crate::services::similarity::compute_similarity_scores;
use crate::utils::{ApiError, ApiResult, StageError};

const GRAPH_TRIPLE_CHAR_CAP: usize = 1800;
const SIMILARITY_TOP_K: usize = 10;

// ============================================================================
// Query & parameter coercion
// ============================================================================

fn default_sync() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeQuery {
    /// Synchronous execution toggle; async execution is not supported.
    #[serde(default = "default_sync")]
    pub sync: bool,
    /// Emit pre/post-upsert diagnostics (truthy values: 1, true, on, yes).
    #[serde(default)]
    pub debug: Option<String>,
}

fn is_truthy_str(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn is_truthy_value(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|v| v != 0.0),
        Some(Value::String(text)) => is_truthy_str(text),
        _ => false,
    }
}

fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn resolve_int_param(
    primary: Option<i64>,
    fallback: Option<&Value>,
    key: &str,
    default: i64,
    ge: Option<i64>,
    le: Option<i64>,
) -> ApiResult<i64> {
    let candidate = match primary {
        Some(value) => Some(value),
        None => match fallback {
            Some(raw) => Some(
                coerce_int(raw)
                    .ok_or_else(|| ApiError::invalid_input(format!("{} must be an integer", key)))?,
            ),
            None => None,
        },
    };
    let Some(value) = candidate else { return Ok(default) };
    if let Some(min) = ge {
        if value < min {
            return Err(ApiError::invalid_input(format!("{} must be ≥ {}", key, min)));
        }
    }
    if let Some(max) = le {
        if value > max {
            return Err(ApiError::invalid_input(format!("{} must be ≤ {}", key, max)));
        }
    }
    Ok(value)
}

fn resolve_float_param(
    primary: Option<f64>,
    fallback: Option<&Value>,
    key: &str,
    default: Option<f64>,
    ge: Option<f64>,
    le: Option<f64>,
) -> ApiResult<Option<f64>> {
    let candidate = match primary {
        Some(value) => Some(value),
        None => match fallback {
            Some(raw) => Some(
                coerce_float(raw)
                    .ok_or_else(|| ApiError::invalid_input(format!("{} must be a number", key)))?,
            ),
            None => None,
        },
    };
    let Some(value) = candidate else { return Ok(default) };
    if let Some(min) = ge {
        if value < min {
            return Err(ApiError::invalid_input(format!("{} must be ≥ {}", key, min)));
        }
    }
    if let Some(max) = le {
        if value > max {
            return Err(ApiError::invalid_input(format!("{} must be ≤ {}", key, max)));
        }
    }
    Ok(Some(value))
}

fn resolve_slot_override(raw: Option<&Value>, key: &str) -> ApiResult<Option<usize>> {
    let Some(raw) = raw else { return Ok(None) };
    let value = coerce_int(raw)
        .ok_or_else(|| ApiError::invalid_input(format!("{} must be an integer", key)))?;
    if value < 0 {
        return Err(ApiError::invalid_input(format!("{} must be ≥ 0", key)));
    }
    Ok(Some(value as usize))
}

// ============================================================================
// Small pipeline helpers
// ============================================================================

fn replace_image_tokens(text: &str, image_id: &str) -> String {
    text.replace("(IMAGE_ID)", image_id).replace("IMAGE_ID", image_id)
}

fn substitute_tokens(text: &mut String, image_id: &str) {
    *text = replace_image_tokens(text, image_id);
}

fn substitute_opt(text: &mut Option<String>, image_id: &str) {
    if let Some(inner) = text {
        *inner = replace_image_tokens(inner, image_id);
    }
}

/// Coverage/depth signal in [0, 1] from path count and total triples.
fn graph_paths_strength(path_count: usize, triple_total: usize) -> f64 {
    if path_count == 0 || triple_total == 0 {
        return 0.0;
    }
    let coverage = (path_count as f64 / 3.0).min(1.0);
    let depth = (triple_total as f64 / 6.0).min(1.0);
    ((coverage * 0.4 + depth * 0.6).min(1.0) * 1000.0).round() / 1000.0
}

/// Synthesise evidence paths from normalised findings when the graph
/// returned none (one per finding, up to `limit`).
fn fallback_paths_from_findings(
    image_id: &str,
    findings: &[FactFinding],
    limit: usize,
) -> Vec<EvidencePath> {
    if findings.is_empty() {
        return Vec::new();
    }
    let budget = limit.max(1);
    let token = if image_id.trim().is_empty() { "UNKNOWN" } else { image_id.trim() };
    let mut fallback_paths = Vec::new();
    for finding in findings {
        let fid = finding
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("FALLBACK_{}", fallback_paths.len() + 1));
        let label = finding
            .r#type
            .clone()
            .filter(|kind| !kind.is_empty())
            .unwrap_or_else(|| format!("Finding[{}]", fid));
        let mut triples = vec![format!("Image[{}] -HAS_FINDING-> Finding[{}]", token, fid)];
        if let Some(location) = finding.location.as_deref().map(str::trim) {
            if !location.is_empty() {
                triples.push(format!("Finding[{}] -LOCATED_IN-> Anatomy[{}]", fid, location));
            }
        }
        fallback_paths.push(EvidencePath {
            label,
            triples,
            score: Some(finding.conf.unwrap_or(0.5)),
            slot: Some(Slot::Findings),
        });
        if fallback_paths.len() >= budget {
            break;
        }
    }
    fallback_paths
}

fn resolve_confidence_level(score: f64, path_triples: usize) -> &'static str {
    if score >= 0.7 && path_triples >= 3 {
        "high"
    } else if score >= 0.5 && path_triples >= 3 {
        "medium"
    } else {
        "low"
    }
}

/// Stable seed for the debug-only normalised-bundle cache.
fn compute_cache_seed(payload: &AnalyzeRequest) -> Option<String> {
    if let Some(file_path) = payload.file_path.as_deref() {
        let absolute = std::fs::canonicalize(file_path)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| file_path.to_string());
        return Some(absolute);
    }
    if let Some(image_id) = payload.image_id.as_deref().map(str::trim) {
        if !image_id.is_empty() {
            return Some(image_id.to_string());
        }
    }
    if let Some(image_b64) = payload.image_b64.as_deref() {
        let digest = hex::encode(Sha1::digest(image_b64.as_bytes()));
        return Some(format!("b64:{}", digest));
    }
    if let Some(key) = payload.idempotency_key.as_deref().map(str::trim) {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    None
}

/// Base64 decode xor filesystem read.
fn read_image_bytes(payload: &AnalyzeRequest) -> ApiResult<(Vec<u8>, Option<String>)> {
    if let Some(image_b64) = payload.image_b64.as_deref() {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(image_b64.trim())
            .map_err(|_| ApiError::invalid_input("invalid base64 image payload"))?;
        if bytes.is_empty() {
            return Err(ApiError::invalid_input("empty image payload"));
        }
        return Ok((bytes, None));
    }
    if let Some(file_path) = payload.file_path.as_deref() {
        let path = Path::new(file_path);
        if !path.exists() {
            return Err(ApiError::invalid_input("file_path does not exist"));
        }
        let bytes = std::fs::read(path)
            .map_err(|e| ApiError::invalid_input(format!("failed to read file: {}", e)))?;
        return Ok((bytes, Some(path.display().to_string())));
    }
    Err(ApiError::invalid_input("either image_b64 or file_path is required"))
}

/// Convert an unexpected error into a 500 StageFailure carrying the stage
/// tag; validation-class errors pass through untouched.
fn wrap_stage(stage: &str, err: ApiError, errors: &mut Vec<StageError>) -> ApiError {
    match err {
        ApiError::Other(inner) => {
            let msg = inner.to_string();
            errors.push(StageError::new(stage, &msg));
            ApiError::stage_failure(stage, msg, errors.clone())
        },
        other => other,
    }
}

fn to_fact_finding(finding: &FindingRecord) -> FactFinding {
    FactFinding {
        id: Some(finding.id.clone()),
        r#type: finding.r#type.clone(),
        location: finding.location.clone(),
        size_cm: finding.size_cm,
        conf: finding.conf,
    }
}

// ============================================================================
// Handler
// ============================================================================

/// POST /pipeline/analyze
#[utoipa::path(
    post,
    path = "/pipeline/analyze",
    params(
        ("sync" = Option<bool>, Query, description = "Synchronous execution toggle"),
        ("debug" = Option<String>, Query, description = "Emit structured diagnostics"),
    ),
    request_body = AnalyzeRequest,
    responses(
        (status = 200, description = "Consensus answer with provenance", body = AnalyzeResponse),
        (status = 400, description = "Async execution requested"),
        (status = 422, description = "Validation failure"),
        (status = 503, description = "Dependency unavailable"),
        (status = 500, description = "Stage failure"),
    ),
    tag = "Pipeline"
)]
pub async fn analyze(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnalyzeQuery>,
    Json(payload): Json<AnalyzeRequest>,
) -> ApiResult<Json<AnalyzeResponse>> {
    if !query.sync {
        return Err(ApiError::not_supported("async execution is not supported"));
    }

    // Dependency preflight: three concurrent probes, all must pass.
    let (llm_up, vlm_up, graph_up) =
        tokio::join!(state.llm.health(), state.vlm.health(), state.graph.health());
    for (label, up) in [("llm", llm_up), ("vlm", vlm_up), ("graph", graph_up)] {
        if !up {
            return Err(ApiError::dependency_unavailable(label));
        }
    }

    payload
        .validate()
        .map_err(|e| ApiError::invalid_input(e.to_string()))?;
    let modes = payload.resolved_modes().map_err(ApiError::invalid_input)?;

    let debug_enabled = query.debug.as_deref().is_some_and(is_truthy_str);
    let mut debug = DebugPayloadBuilder::new(debug_enabled);

    let mut timings = Timings::default();
    let mut errors: Vec<StageError> = Vec::new();
    let mut overall_status: Option<String> = None;
    let mut overall_notes: Option<String> = None;
    let mut graph_degraded = false;

    // ------------------------------------------------------------------
    // Parameter resolution (422 on type/bound violations)
    // ------------------------------------------------------------------
    let params = &payload.parameters;
    let force_dummy_fallback = is_truthy_value(params.force_dummy_fallback.as_ref());
    let resolved_k_paths = resolve_int_param(
        payload.k_paths,
        params.k_paths.as_ref(),
        "k_paths",
        payload.k,
        Some(0),
        Some(10),
    )? as usize;
    let slot_overrides = SlotOverrides {
        findings: resolve_slot_override(params.k_findings.as_ref(), "k_findings")?,
        reports: resolve_slot_override(params.k_reports.as_ref(), "k_reports")?,
        similarity: resolve_slot_override(params.k_similarity.as_ref(), "k_similarity")?,
    };
    let alpha_param =
        resolve_float_param(payload.alpha_finding, params.alpha_finding.as_ref(), "alpha_finding", None, None, None)?;
    let beta_param =
        resolve_float_param(payload.beta_report, params.beta_report.as_ref(), "beta_report", None, None, None)?;
    let similarity_threshold = resolve_float_param(
        payload.similarity_threshold,
        params.similarity_threshold.as_ref(),
        "similarity_threshold",
        Some(0.5),
        Some(0.0),
        Some(1.0),
    )?
    .unwrap_or(0.5);

    let cache_seed = if debug_enabled { compute_cache_seed(&payload) } else { None };
    let cache_dir: Option<PathBuf> = if debug_enabled {
        state.config.cache.debug_cache_dir.as_deref().map(PathBuf::from)
    } else {
        None
    };

    // ------------------------------------------------------------------
    // Stage: image_load
    // ------------------------------------------------------------------
    let (image_bytes, image_path) = read_image_bytes(&payload)?;
    debug.set_stage("image_load");

    // Inline payloads land in a temp file for the VLM; the guard removes it
    // after the vlm stage.
    let mut temp_file: Option<tempfile::NamedTempFile> = None;
    let path_for_vlm: PathBuf = match image_path.as_deref() {
        Some(path) => PathBuf::from(path),
        None => {
            let suffix = payload
                .file_path
                .as_deref()
                .and_then(|p| Path::new(p).extension().and_then(|e| e.to_str()))
                .map(|ext| format!(".{}", ext))
                .unwrap_or_else(|| ".png".to_string());
            let mut tmp = tempfile::Builder::new()
                .suffix(&suffix)
                .tempfile()
                .map_err(|e| ApiError::Other(anyhow::anyhow!("temp file failed: {}", e)))?;
            tmp.write_all(&image_bytes)
                .map_err(|e| ApiError::Other(anyhow::anyhow!("temp file failed: {}", e)))?;
            let path = tmp.path().to_path_buf();
            temp_file = Some(tmp);
            path
        },
    };

    // ------------------------------------------------------------------
    // Stage: vlm
    // ------------------------------------------------------------------
    let vlm_start = Instant::now();
    let mut normalized = normalize_from_vlm(
        state.vlm.as_ref(),
        &state.registry,
        &path_for_vlm,
        NormalizeOptions {
            image_id: payload.image_id.as_deref(),
            force_dummy_fallback,
            cache_seed: cache_seed.as_deref(),
            cache_dir: cache_dir.as_deref(),
        },
    )
    .await
    .map_err(|e| wrap_stage("vlm", e, &mut errors))?;
    timings.vlm_ms = vlm_start.elapsed().as_millis() as u64;
    debug.set_stage("vlm");
    drop(temp_file);

    // ------------------------------------------------------------------
    // Identity resolution
    // ------------------------------------------------------------------
    let resolved_path = payload.file_path.clone().or_else(|| image_path.clone());
    let identity = identify_image(
        IdentityPayload {
            case_id: payload.case_id.as_deref(),
            image_id: payload.image_id.as_deref(),
            file_path: payload.file_path.as_deref(),
            idempotency_key: payload.idempotency_key.as_deref(),
        },
        &mut normalized.image,
        resolved_path.as_deref(),
        image_path.as_deref(),
        &state.registry,
    )?;

    let mut image_id = identity.image_id.clone();
    let case_id = identity.case_id.clone();

    tracing::info!(
        case_id = %case_id,
        image_id = %image_id,
        image_id_source = identity.image_id_source.as_str(),
        storage_uri_key = identity.storage_uri_key.as_deref().unwrap_or(""),
        dummy_lookup_hit = identity.seed_hit,
        "pipeline normalised image identity"
    );

    // ------------------------------------------------------------------
    // Findings: dedup, seeded fallback, provenance
    // ------------------------------------------------------------------
    let mut normalized_findings = dedup_findings(normalized.findings.clone());
    let seeded_records = state.registry.resolve_findings(&image_id);

    let mut fallback_used = normalized.finding_fallback.used;
    let mut fallback_strategy = normalized.finding_fallback.strategy.clone();
    let mut fallback_registry_hit = normalized.finding_fallback.registry_hit;
    let fallback_forced = normalized.finding_fallback.forced || force_dummy_fallback;

    let mut seeded_applied = false;
    if (force_dummy_fallback || normalized_findings.is_empty()) && !seeded_records.is_empty() {
        normalized_findings = dedup_findings(seeded_records.clone());
        seeded_applied = true;
        fallback_used = true;
        fallback_registry_hit = true;
        if fallback_strategy.is_none() {
            fallback_strategy = Some("mock_seed".to_string());
        }
    }
    normalized.findings = normalized_findings.clone();

    let mut seeded_finding_ids: Vec<String> = Vec::new();
    for finding in &normalized_findings {
        if finding.source.as_deref() == Some("mock_seed")
            && !seeded_finding_ids.contains(&finding.id)
        {
            seeded_finding_ids.push(finding.id.clone());
        }
    }
    if seeded_applied && seeded_finding_ids.is_empty() {
        seeded_finding_ids = seeded_records.iter().map(|stub| stub.id.clone()).collect();
    }

    let finding_source: Option<String> = if fallback_used {
        fallback_strategy
            .clone()
            .or_else(|| fallback_registry_hit.then(|| "mock_seed".to_string()))
            .or_else(|| Some("fallback".to_string()))
    } else {
        normalized_findings
            .iter()
            .find_map(|finding| finding.source.clone())
            .or_else(|| (!seeded_finding_ids.is_empty()).then(|| "mock_seed".to_string()))
            .or_else(|| (!normalized_findings.is_empty()).then(|| "vlm".to_string()))
    };

    let public_fallback = FallbackMeta {
        used: fallback_used,
        forced: fallback_forced,
        strategy: if fallback_used && finding_source.is_some() {
            finding_source.clone()
        } else {
            fallback_strategy.clone()
        },
        registry_hit: fallback_registry_hit,
        seeded_ids: seeded_finding_ids.clone(),
    };
    normalized.finding_fallback = public_fallback.clone();
    let mut fallback_guard = FallbackMetaGuard::new(public_fallback.clone(), "pre_upsert");
    let provenance = ProvenancePayload {
        finding_source: finding_source.clone(),
        seeded_finding_ids: seeded_finding_ids.clone(),
        finding_fallback: public_fallback.clone(),
    };

    if fallback_used {
        tracing::info!(
            case_id = %case_id,
            image_id = %image_id,
            strategy = public_fallback.strategy.as_deref().unwrap_or("unknown"),
            registry_hit = fallback_registry_hit,
            forced = fallback_forced,
            "finding fallback engaged"
        );
    }

    debug.set_stage("pre_upsert");
    debug.record("normalized_image", &normalized.image);
    debug.record("norm_image_id", &image_id);
    debug.record("norm_image_id_source", identity.image_id_source.as_str());
    if let Some(uri) = identity.storage_uri.as_deref() {
        debug.record("storage_uri", uri);
    }
    debug.record("dummy_lookup_hit", identity.seed_hit);
    if let Some(source) = identity.lookup_source.as_deref() {
        debug.record("dummy_lookup_source", source);
    }
    if !identity.seed_hit && identity.image_id_source != ImageIdSource::Payload {
        debug.record("norm_image_id_warning", "dummy_lookup_miss");
    }
    debug.record("finding_fallback", &public_fallback);
    if let Some(source) = finding_source.as_deref() {
        debug.record("finding_source", source);
    }
    debug.record("seeded_finding_ids", &seeded_finding_ids);
    debug.record("finding_provenance", &provenance);
    debug.record("pre_upsert_findings_len", normalized_findings.len());
    debug.record(
        "pre_upsert_findings_head",
        &normalized_findings.iter().take(2).collect::<Vec<_>>(),
    );
    debug.record("pre_upsert_report_conf", normalized.report.conf);

    let graph_repo = GraphRepo::new(Arc::clone(&state.graph));
    let context_builder = GraphContextBuilder::new(GraphRepo::new(Arc::clone(&state.graph)));

    // ------------------------------------------------------------------
    // Stage: upsert
    // ------------------------------------------------------------------
    let upsert_start = Instant::now();
    let receipt = graph_repo
        .upsert_case(&CaseUpsert {
            case_id: case_id.clone(),
            image: normalized.image.clone(),
            report: normalized.report.clone(),
            findings: normalized_findings.clone(),
            idempotency_key: payload.idempotency_key.clone(),
        })
        .await
        .map_err(|e| wrap_stage("upsert", e, &mut errors))?;
    timings.upsert_ms = upsert_start.elapsed().as_millis() as u64;

    if !receipt.image_id.is_empty() && receipt.image_id != image_id {
        image_id = receipt.image_id.clone();
        normalized.image.image_id = Some(image_id.clone());
    }
    let mut finding_ids = receipt.finding_ids.clone();

    debug.set_stage("post_upsert");
    debug.record(
        "upsert_receipt",
        serde_json::json!({ "image_id": receipt.image_id, "finding_ids": receipt.finding_ids }),
    );
    debug.record("post_upsert_finding_ids", &finding_ids);

    // Receipt came back without finding ids: re-query before deciding
    // between degraded-and-continue and a hard mismatch.
    if !normalized_findings.is_empty() && finding_ids.is_empty() {
        let expected: Vec<String> =
            normalized_findings.iter().map(|finding| finding.id.clone()).collect();
        let verified = graph_repo
            .fetch_finding_ids(&image_id, Some(&expected))
            .await
            .unwrap_or_default();
        debug.record("post_upsert_verified_ids", &verified);
        if verified.is_empty() {
            errors.push(StageError::new("upsert", "finding_upsert_mismatch"));
            return Err(ApiError::upsert_mismatch(image_id, errors));
        }
        graph_degraded = true;
        errors.push(StageError::new(
            "upsert",
            "normalized findings present but upsert returned no finding_ids",
        ));
        overall_status = Some("degraded".to_string());
        overall_notes = Some("graph upsert failed, fallback used".to_string());
        finding_ids = verified;
    }

    // ------------------------------------------------------------------
    // Stage: similarity (failures recorded, never fatal)
    // ------------------------------------------------------------------
    let mut similar_seed_images: Vec<SimilarImage> = Vec::new();
    let mut similarity_edges_created = 0usize;
    let mut similarity_candidates_considered = 0usize;
    match graph_repo.fetch_similarity_candidates(&image_id).await {
        Ok(candidates) => {
            similarity_candidates_considered = candidates.len();
            let (edges, summary) = compute_similarity_scores(
                normalized.image.modality.as_deref(),
                &normalized_findings,
                &candidates,
                similarity_threshold,
                SIMILARITY_TOP_K,
            );
            similar_seed_images = summary;
            match graph_repo.sync_similarity_edges(&image_id, &edges).await {
                Ok(created) => similarity_edges_created = created,
                Err(e) => errors.push(StageError::new("similarity", e.to_string())),
            }
        },
        Err(e) => errors.push(StageError::new("similarity", e.to_string())),
    }

    // ------------------------------------------------------------------
    // Stage: context
    // ------------------------------------------------------------------
    let context_start = Instant::now();
    let mut context_bundle: ContextBundle = context_builder
        .build_bundle(
            &image_id,
            &BundleOptions {
                k: resolved_k_paths,
                max_chars: GRAPH_TRIPLE_CHAR_CAP,
                alpha_finding: alpha_param,
                beta_report: beta_param,
                k_slots: slot_overrides,
            },
        )
        .await
        .map_err(|e| wrap_stage("context", e, &mut errors))?;
    timings.context_ms = context_start.elapsed().as_millis() as u64;

    // Degraded graph with empty facts: surface the normalised findings so
    // downstream consumers still see evidence.
    if graph_degraded && context_bundle.facts.findings.is_empty() && !normalized_findings.is_empty()
    {
        context_bundle.facts.image_id = image_id.clone();
        context_bundle.facts.findings =
            normalized_findings.iter().map(to_fact_finding).collect();
    }
    let findings_list: Vec<FactFinding> = context_bundle.facts.findings.clone();

    // Empty paths with known findings: synthesise fallback paths.
    let mut context_fallback_paths = 0usize;
    if context_bundle.paths.is_empty() && !findings_list.is_empty() {
        let mut budget = context_bundle.slot_limits.findings;
        if budget == 0 {
            budget = findings_list.len().min(2);
        }
        let fallback_paths = fallback_paths_from_findings(&image_id, &findings_list, budget);
        if !fallback_paths.is_empty() {
            context_fallback_paths = fallback_paths.len();
            ensure_findings_slot_allocation(&mut context_bundle, fallback_paths.len());
            context_bundle.paths = fallback_paths;
        }
    }

    let no_graph_evidence =
        findings_list.is_empty() && context_bundle.paths.is_empty() && finding_ids.is_empty();

    let ctx_paths_total: usize =
        context_bundle.paths.iter().map(|path| path.triples.len()).sum();
    let has_paths = !context_bundle.paths.is_empty();
    let paths_strength = graph_paths_strength(context_bundle.paths.len(), ctx_paths_total);

    // Provenance propagation into the graph context view.
    if context_bundle.finding_source.is_none() {
        context_bundle.finding_source = finding_source.clone();
    }
    if context_bundle.seeded_finding_ids.is_none() {
        context_bundle.seeded_finding_ids = Some(seeded_finding_ids.clone());
    }
    if context_bundle.finding_fallback.is_none() {
        context_bundle.finding_fallback = Some(fallback_guard.snapshot("graph_context"));
    }
    if context_bundle.finding_provenance.is_none() {
        context_bundle.finding_provenance = Some(provenance.clone());
    }

    debug.set_stage("context");
    debug.record("context_summary", &context_bundle.summary);
    debug.record("context_findings_len", findings_list.len());
    debug.record("context_findings_head", &findings_list.iter().take(2).collect::<Vec<_>>());
    debug.record("context_paths_len", context_bundle.paths.len());
    debug.record(
        "context_paths_head",
        &context_bundle.paths.iter().take(2).collect::<Vec<_>>(),
    );
    debug.record("context_paths_triple_total", ctx_paths_total);
    debug.record("graph_paths_strength", paths_strength);
    debug.record("context_slot_limits", context_bundle.slot_limits);
    debug.record("similar_seed_images", &similar_seed_images);
    debug.record("similarity_edges_created", similarity_edges_created);
    debug.record("similarity_threshold", similarity_threshold);
    debug.record("similarity_candidates_considered", similarity_candidates_considered);
    if context_fallback_paths > 0 {
        debug.record("context_fallback_paths_len", context_fallback_paths);
        debug.record("context_fallback_slot", "findings");
    }
    debug.record("context_consistency", context_bundle.slot_meta.allocated_total >= context_bundle.paths.len());
    if graph_degraded {
        debug.record("graph_degraded", true);
    }

    // ------------------------------------------------------------------
    // Stages: llm_v / llm_vl / llm_vgl
    // ------------------------------------------------------------------
    let mut results = ModeResults::default();
    let mut vgl_fallback_used = false;
    let mut vgl_fallback_reason: Option<String> = None;

    if modes.contains(&Mode::V) {
        let start = Instant::now();
        let output = run_v_mode(&normalized, payload.max_chars)?;
        timings.llm_v_ms = start.elapsed().as_millis() as u64;
        results.v = Some(ModeOutput { latency_ms: timings.llm_v_ms, ..output });
    }

    if modes.contains(&Mode::VL) {
        let start = Instant::now();
        let output = run_vl_mode(state.llm.as_ref(), &normalized, payload.max_chars).await?;
        timings.llm_vl_ms = start.elapsed().as_millis() as u64;
        results.vl = Some(output);
    }

    if modes.contains(&Mode::VGL) {
        if !normalized_findings.is_empty() || !no_graph_evidence {
            let start = Instant::now();
            let mut output = run_vgl_mode(
                state.llm.as_ref(),
                &context_bundle.triples,
                &normalized,
                payload.max_chars,
                payload.fallback_to_vl,
            )
            .await?;
            timings.llm_vgl_ms = start.elapsed().as_millis() as u64;
            if output.degraded == Degraded::Vl {
                let reason = output
                    .reason
                    .clone()
                    .unwrap_or_else(|| "graph context empty; fell back to VL".to_string());
                output.reason = Some(reason.clone());
                vgl_fallback_used = true;
                vgl_fallback_reason = Some(reason);
            }
            results.vgl = Some(output);
        } else if payload.fallback_to_vl {
            if results.vl.is_none() {
                let start = Instant::now();
                let output =
                    run_vl_mode(state.llm.as_ref(), &normalized, payload.max_chars).await?;
                timings.llm_vl_ms = start.elapsed().as_millis() as u64;
                results.vl = Some(output);
            }
            timings.llm_vgl_ms = 0;
            let mut vgl_output = results.vl.clone().unwrap_or_default();
            vgl_output.degraded = Degraded::Vl;
            if debug_enabled {
                vgl_output.reason = Some("graph_evidence_missing_or_findings_empty".to_string());
            }
            results.vgl = Some(vgl_output);
            vgl_fallback_used = true;
            vgl_fallback_reason = Some("graph_evidence_missing_or_findings_empty".to_string());
        } else {
            timings.llm_vgl_ms = 0;
            results.vgl = Some(ModeOutput {
                text: "Graph findings unavailable".to_string(),
                latency_ms: 0,
                ..Default::default()
            });
        }
    }

    if let Some(vgl) = results.vgl.as_mut() {
        if let Some(source) = finding_source.as_deref() {
            vgl.finding_source = Some(source.to_string());
            if !seeded_finding_ids.is_empty() {
                vgl.seeded_finding_ids = Some(seeded_finding_ids.clone());
            }
        }
    }

    // Cross-mode graph mismatch: V/VL entries far from a grounded VGL
    // answer are marked degraded.
    if has_paths {
        let vgl_norm = results
            .vgl
            .as_ref()
            .filter(|entry| !entry.degraded.is_degraded())
            .map(|entry| normalise_for_consensus(&entry.text))
            .filter(|norm| !norm.is_empty());
        if let Some(vgl_norm) = vgl_norm {
            for mode in [Mode::V, Mode::VL] {
                let Some(entry) = results.get_mut(mode) else { continue };
                if entry.degraded.is_degraded() {
                    continue;
                }
                let mode_norm = normalise_for_consensus(&entry.text);
                if mode_norm.is_empty() || jaccard_similarity(&mode_norm, &vgl_norm) < 0.1 {
                    entry.degraded = Degraded::GraphMismatch;
                    entry
                        .notes
                        .get_or_insert_with(|| "mismatch with graph-backed output".to_string());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Stage: consensus
    // ------------------------------------------------------------------
    let mut weights = std::collections::HashMap::new();
    weights.insert(Mode::V, 1.0);
    weights.insert(Mode::VL, 1.2);
    weights.insert(Mode::VGL, if has_paths { 1.8 } else { 1.0 });

    let consensus_inputs: Vec<(Mode, &ModeOutput)> = [Mode::V, Mode::VL, Mode::VGL]
        .into_iter()
        .filter_map(|mode| results.get(mode).map(|entry| (mode, entry)))
        .collect();
    let mut consensus = compute_consensus(
        &consensus_inputs,
        &ConsensusOptions {
            modality: normalized.image.modality.as_deref(),
            weights,
            min_agree: 0.35,
            anchor_mode: has_paths.then_some(Mode::VGL),
            anchor_min_score: 0.75,
            structured_findings: &findings_list,
            graph_paths_strength: paths_strength,
        },
    );

    if vgl_fallback_used {
        consensus.status = ConsensusStatus::LowConfidence;
        consensus.confidence = crate::models::Confidence::VeryLow;
        let fallback_note = vgl_fallback_reason
            .as_deref()
            .map(|reason| reason.replace('_', " "))
            .unwrap_or_else(|| "graph evidence missing; fell back to VL".to_string());
        consensus.notes = Some(match consensus.notes.take() {
            Some(existing) => format!("{} | {}", existing, fallback_note),
            None => fallback_note,
        });
        results.status = Some("low_confidence".to_string());
    }

    // Image-token substitution across mode and consensus texts.
    for mode in [Mode::V, Mode::VL, Mode::VGL] {
        if let Some(entry) = results.get_mut(mode) {
            substitute_tokens(&mut entry.text, &image_id);
        }
    }
    substitute_tokens(&mut consensus.text, &image_id);
    substitute_tokens(&mut consensus.presented_text, &image_id);
    substitute_opt(&mut consensus.notes, &image_id);

    // ------------------------------------------------------------------
    // Post-consensus safety filter
    // ------------------------------------------------------------------
    if let Some(expected_organ) = infer_expected_organ(payload.file_path.as_deref()) {
        if apply_organ_guard(&mut consensus, expected_organ) {
            tracing::warn!(
                case_id = %case_id,
                image_id = %image_id,
                expected_organ,
                "organ guard downgraded consensus"
            );
        }
    }

    results.finding_source = finding_source.clone();
    if !seeded_finding_ids.is_empty() {
        results.seeded_finding_ids = Some(seeded_finding_ids.clone());
    }
    results.finding_fallback = Some(fallback_guard.snapshot("results"));
    results.finding_provenance = Some(provenance.clone());
    results.similar_seed_images = Some(similar_seed_images.clone());
    results.consensus = Some(consensus.clone());
    debug.record("consensus", &consensus);

    // ------------------------------------------------------------------
    // Evaluation assembly
    // ------------------------------------------------------------------
    let agreement_score = consensus.agreement_score;
    let confidence_level = resolve_confidence_level(agreement_score, ctx_paths_total);
    let evaluation_consensus = EvaluationConsensus {
        text: replace_image_tokens(&consensus.text, &image_id),
        status: consensus.status.as_str().to_string(),
        notes: consensus
            .notes
            .as_deref()
            .map(|notes| replace_image_tokens(notes, &image_id))
            .unwrap_or_default(),
        supporting_modes: (!consensus.supporting_modes.is_empty())
            .then(|| consensus.supporting_modes.clone()),
        disagreed_modes: (!consensus.disagreed_modes.is_empty())
            .then(|| consensus.disagreed_modes.clone()),
    };

    let evaluation_status = if graph_degraded {
        Some("degraded".to_string())
    } else {
        Some(consensus.status.as_str().to_string())
    };
    let evaluation_notes = if graph_degraded && overall_notes.is_some() {
        overall_notes.clone()
    } else {
        (!evaluation_consensus.notes.is_empty()).then(|| evaluation_consensus.notes.clone())
    };

    let evaluation = EvaluationPayload {
        image_id: image_id.clone(),
        similar_seed_images,
        edges_created: similarity_edges_created,
        ctx_paths_len: ctx_paths_total,
        agreement_score,
        confidence: confidence_level.to_string(),
        context_paths: context_bundle.paths.clone(),
        consensus: evaluation_consensus,
        status: evaluation_status,
        notes: evaluation_notes,
        finding_source: finding_source.clone(),
        seeded_finding_ids: seeded_finding_ids.clone(),
        finding_fallback: fallback_guard.snapshot("evaluation"),
        finding_provenance: provenance.clone(),
    };
    debug.record("evaluation", &evaluation);

    // The four provenance views must be byte-identical; a divergence is a
    // bug worth failing loudly about in logs.
    for (view, meta) in [
        ("graph_context", context_bundle.finding_fallback.as_ref()),
        ("results", results.finding_fallback.as_ref()),
        ("evaluation", Some(&evaluation.finding_fallback)),
    ] {
        if let Some(meta) = meta {
            if let Err(e) = fallback_guard.ensure(meta, view) {
                tracing::error!("fallback meta diverged: {}", e);
                errors.push(StageError::new("provenance", e.to_string()));
            }
        }
    }

    let response = AnalyzeResponse {
        ok: true,
        case_id,
        image_id,
        graph_context: context_bundle,
        results,
        timings,
        errors,
        debug: debug.payload(),
        evaluation,
        status: overall_status,
        notes: overall_notes,
    };

    Ok(Json(response))
}
