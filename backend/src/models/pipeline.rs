//! Typed request/response records for the analyze pipeline.
//!
//! The reference flow shuttled loosely-typed dictionaries between stages;
//! here every cross-stage payload is a named record and only the `debug`
//! blob stays free-form.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use validator::Validate;

use crate::utils::StageError;

// ============================================================================
// Reasoning modes
// ============================================================================

/// Reasoning mode requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
pub enum Mode {
    /// Vision-only caption.
    V,
    /// Vision + language rewrite.
    VL,
    /// Vision + graph-grounded + language.
    VGL,
}

impl Mode {
    /// Preference order used when a single representative must be chosen.
    pub const PRIORITY: [Mode; 3] = [Mode::VGL, Mode::VL, Mode::V];

    pub fn priority_rank(self) -> usize {
        Self::PRIORITY.iter().position(|m| *m == self).unwrap_or(Self::PRIORITY.len())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::V => "V",
            Mode::VL => "VL",
            Mode::VGL => "VGL",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_uppercase().as_str() {
            "V" => Ok(Mode::V),
            "VL" => Ok(Mode::VL),
            "VGL" => Ok(Mode::VGL),
            _ => Err(format!("unsupported mode '{}'", raw)),
        }
    }
}

// ============================================================================
// Request
// ============================================================================

fn default_modes() -> Vec<String> {
    vec!["V".to_string(), "VL".to_string(), "VGL".to_string()]
}

fn default_k() -> i64 {
    2
}

fn default_max_chars() -> usize {
    30
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    20_000
}

/// Optional overrides for similarity/context scoring. Values arrive as raw
/// JSON so type errors surface as 422 details instead of body rejections;
/// unknown keys are ignored.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct AnalyzeParameters {
    #[schema(value_type = Option<i64>)]
    pub k_paths: Option<serde_json::Value>,
    #[schema(value_type = Option<i64>)]
    pub k_findings: Option<serde_json::Value>,
    #[schema(value_type = Option<i64>)]
    pub k_reports: Option<serde_json::Value>,
    #[schema(value_type = Option<i64>)]
    pub k_similarity: Option<serde_json::Value>,
    #[schema(value_type = Option<f64>)]
    pub alpha_finding: Option<serde_json::Value>,
    #[schema(value_type = Option<f64>)]
    pub beta_report: Option<serde_json::Value>,
    #[schema(value_type = Option<String>)]
    pub force_dummy_fallback: Option<serde_json::Value>,
    #[schema(value_type = Option<f64>)]
    pub similarity_threshold: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct AnalyzeRequest {
    /// Existing case identifier
    pub case_id: Option<String>,
    /// Optional image identifier
    pub image_id: Option<String>,
    /// Inline base64 image payload
    pub image_b64: Option<String>,
    /// Filesystem path to image
    pub file_path: Option<String>,
    #[serde(default = "default_modes")]
    pub modes: Vec<String>,
    #[serde(default = "default_k")]
    #[validate(range(min = 1, max = 10))]
    pub k: i64,
    #[serde(default = "default_max_chars")]
    #[validate(range(min = 1, max = 120))]
    pub max_chars: usize,
    #[serde(default = "default_true")]
    pub fallback_to_vl: bool,
    #[serde(default = "default_timeout_ms")]
    #[validate(range(min = 1000, max = 60000))]
    pub timeout_ms: u64,
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub parameters: AnalyzeParameters,
    #[validate(range(min = 0, max = 10))]
    pub k_paths: Option<i64>,
    pub alpha_finding: Option<f64>,
    pub beta_report: Option<f64>,
    pub similarity_threshold: Option<f64>,
}

impl AnalyzeRequest {
    /// Normalise and validate the requested mode set. Order-preserving dedupe.
    pub fn resolved_modes(&self) -> Result<Vec<Mode>, String> {
        if self.modes.is_empty() {
            return Err("modes must not be empty".to_string());
        }
        let mut resolved: Vec<Mode> = Vec::new();
        for raw in &self.modes {
            let mode = Mode::from_str(raw)?;
            if !resolved.contains(&mode) {
                resolved.push(mode);
            }
        }
        Ok(resolved)
    }
}

// ============================================================================
// Normalised VLM output
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ImageRecord {
    pub image_id: Option<String>,
    pub path: Option<String>,
    pub modality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_uri_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ReportRecord {
    pub id: String,
    pub text: String,
    pub model: Option<String>,
    pub conf: f64,
    pub ts: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct FindingRecord {
    pub id: String,
    pub r#type: Option<String>,
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conf: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Monotonic record of whether and how seeded or keyword-derived findings
/// were used. Once `used` flips to true it never flips back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct FallbackMeta {
    pub used: bool,
    pub forced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub registry_hit: bool,
    #[serde(default)]
    pub seeded_ids: Vec<String>,
}

/// Provenance copied verbatim into graph_context, results, evaluation and
/// debug (invariant: the four views stay identical).
#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct ProvenancePayload {
    pub finding_source: Option<String>,
    pub seeded_finding_ids: Vec<String>,
    pub finding_fallback: FallbackMeta,
}

/// Fact bundle assembled from one VLM pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizedBundle {
    pub image: ImageRecord,
    pub report: ReportRecord,
    pub findings: Vec<FindingRecord>,
    pub caption: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption_ko: Option<String>,
    pub vlm_latency_ms: u64,
    pub raw_vlm: serde_json::Value,
    pub finding_fallback: FallbackMeta,
}

// ============================================================================
// Graph context
// ============================================================================

/// Category budget for evidence paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    Findings,
    Reports,
    Similarity,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::Findings, Slot::Reports, Slot::Similarity];

    pub fn as_str(self) -> &'static str {
        match self {
            Slot::Findings => "findings",
            Slot::Reports => "reports",
            Slot::Similarity => "similarity",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SlotLimits {
    pub findings: usize,
    pub reports: usize,
    pub similarity: usize,
}

impl SlotLimits {
    pub fn get(&self, slot: Slot) -> usize {
        match slot {
            Slot::Findings => self.findings,
            Slot::Reports => self.reports,
            Slot::Similarity => self.similarity,
        }
    }

    pub fn set(&mut self, slot: Slot, value: usize) {
        match slot {
            Slot::Findings => self.findings = value,
            Slot::Reports => self.reports = value,
            Slot::Similarity => self.similarity = value,
        }
    }

    pub fn total(&self) -> usize {
        self.findings + self.reports + self.similarity
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct SlotMeta {
    pub requested_k: usize,
    pub applied_k: usize,
    /// "auto" or "overrides".
    pub slot_source: String,
    pub requested_overrides: BTreeMap<String, usize>,
    pub allocated_total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retried_findings: Option<bool>,
}

/// Readable description of a reasoning path through the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EvidencePath {
    pub label: String,
    pub triples: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub slot: Option<Slot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SummaryRow {
    pub rel: String,
    pub cnt: u64,
    pub avg_conf: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct FactFinding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub r#type: Option<String>,
    pub location: Option<String>,
    pub size_cm: Option<f64>,
    pub conf: Option<f64>,
}

/// Normalised JSON facts injected alongside the evidence summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ContextFacts {
    pub image_id: String,
    #[serde(default)]
    pub findings: Vec<FactFinding>,
}

/// Edge-first bundle combining summaries, paths and raw facts.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct ContextBundle {
    pub summary: Vec<String>,
    pub summary_rows: Vec<SummaryRow>,
    pub paths: Vec<EvidencePath>,
    pub facts: ContextFacts,
    pub triples: String,
    pub slot_limits: SlotLimits,
    pub slot_meta: SlotMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finding_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seeded_finding_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finding_fallback: Option<FallbackMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finding_provenance: Option<ProvenancePayload>,
}

// ============================================================================
// Mode outputs & consensus
// ============================================================================

/// Degradation marker attached to a mode entry. Serialises as `false`,
/// `"VL"`, or `"graph_mismatch"` to match the public wire format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Degraded {
    #[default]
    No,
    Vl,
    GraphMismatch,
}

impl Degraded {
    pub fn is_degraded(self) -> bool {
        self != Degraded::No
    }
}

impl Serialize for Degraded {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Degraded::No => serializer.serialize_bool(false),
            Degraded::Vl => serializer.serialize_str("VL"),
            Degraded::GraphMismatch => serializer.serialize_str("graph_mismatch"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModeOutput {
    pub text: String,
    pub latency_ms: u64,
    pub degraded: Degraded,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finding_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seeded_finding_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusStatus {
    Agree,
    Disagree,
    Single,
    Empty,
    LowConfidence,
}

impl ConsensusStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsensusStatus::Agree => "agree",
            ConsensusStatus::Disagree => "disagree",
            ConsensusStatus::Single => "single",
            ConsensusStatus::Empty => "empty",
            ConsensusStatus::LowConfidence => "low_confidence",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    VeryLow,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ConsensusResult {
    pub text: String,
    pub presented_text: String,
    pub status: ConsensusStatus,
    pub supporting_modes: Vec<Mode>,
    pub disagreed_modes: Vec<Mode>,
    pub agreement_score: f64,
    pub confidence: Confidence,
    pub evaluated_modes: Vec<Mode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_inputs: Option<Vec<Mode>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Mode outputs plus the shared provenance keys mirrored onto the results
/// object.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModeResults {
    #[serde(rename = "V", skip_serializing_if = "Option::is_none")]
    pub v: Option<ModeOutput>,
    #[serde(rename = "VL", skip_serializing_if = "Option::is_none")]
    pub vl: Option<ModeOutput>,
    #[serde(rename = "VGL", skip_serializing_if = "Option::is_none")]
    pub vgl: Option<ModeOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus: Option<ConsensusResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finding_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seeded_finding_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finding_fallback: Option<FallbackMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finding_provenance: Option<ProvenancePayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similar_seed_images: Option<Vec<SimilarImage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl ModeResults {
    pub fn get(&self, mode: Mode) -> Option<&ModeOutput> {
        match mode {
            Mode::V => self.v.as_ref(),
            Mode::VL => self.vl.as_ref(),
            Mode::VGL => self.vgl.as_ref(),
        }
    }

    pub fn get_mut(&mut self, mode: Mode) -> Option<&mut ModeOutput> {
        match mode {
            Mode::V => self.v.as_mut(),
            Mode::VL => self.vl.as_mut(),
            Mode::VGL => self.vgl.as_mut(),
        }
    }

    pub fn set(&mut self, mode: Mode, output: ModeOutput) {
        match mode {
            Mode::V => self.v = Some(output),
            Mode::VL => self.vl = Some(output),
            Mode::VGL => self.vgl = Some(output),
        }
    }

    pub fn present_modes(&self) -> Vec<Mode> {
        let mut modes = Vec::new();
        for mode in [Mode::V, Mode::VL, Mode::VGL] {
            if self.get(mode).is_some() {
                modes.push(mode);
            }
        }
        modes
    }
}

// ============================================================================
// Similarity & evaluation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SimilarImage {
    pub id: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SimilarityEdge {
    pub image_id: String,
    pub score: f64,
    pub basis: String,
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct EvaluationConsensus {
    pub text: String,
    pub status: String,
    pub notes: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supporting_modes: Option<Vec<Mode>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disagreed_modes: Option<Vec<Mode>>,
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct EvaluationPayload {
    pub image_id: String,
    pub similar_seed_images: Vec<SimilarImage>,
    pub edges_created: usize,
    pub ctx_paths_len: usize,
    pub agreement_score: f64,
    pub confidence: String,
    pub context_paths: Vec<EvidencePath>,
    pub consensus: EvaluationConsensus,
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub finding_source: Option<String>,
    pub seeded_finding_ids: Vec<String>,
    pub finding_fallback: FallbackMeta,
    pub finding_provenance: ProvenancePayload,
}

// ============================================================================
// Response
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct Timings {
    pub vlm_ms: u64,
    pub upsert_ms: u64,
    pub context_ms: u64,
    pub llm_v_ms: u64,
    pub llm_vl_ms: u64,
    pub llm_vgl_ms: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AnalyzeResponse {
    pub ok: bool,
    pub case_id: String,
    pub image_id: String,
    pub graph_context: ContextBundle,
    #[schema(value_type = Object)]
    pub results: ModeResults,
    pub timings: Timings,
    pub errors: Vec<StageError>,
    #[schema(value_type = Object)]
    pub debug: serde_json::Value,
    pub evaluation: EvaluationPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing_normalises_case() {
        assert_eq!(Mode::from_str(" vgl "), Ok(Mode::VGL));
        assert!(Mode::from_str("VQA").is_err());
    }

    #[test]
    fn resolved_modes_dedupes_in_order() {
        let request: AnalyzeRequest = serde_json::from_value(serde_json::json!({
            "file_path": "/tmp/img001.png",
            "modes": ["vl", "V", "VL"],
        }))
        .expect("request should deserialize");
        assert_eq!(request.resolved_modes().unwrap(), vec![Mode::VL, Mode::V]);
    }

    #[test]
    fn degraded_serialises_to_wire_format() {
        assert_eq!(serde_json::to_value(Degraded::No).unwrap(), serde_json::json!(false));
        assert_eq!(serde_json::to_value(Degraded::Vl).unwrap(), serde_json::json!("VL"));
        assert_eq!(
            serde_json::to_value(Degraded::GraphMismatch).unwrap(),
            serde_json::json!("graph_mismatch")
        );
    }

    #[test]
    fn request_defaults_match_contract() {
        let request: AnalyzeRequest =
            serde_json::from_value(serde_json::json!({ "file_path": "/tmp/x.png" }))
                .expect("minimal request");
        assert_eq!(request.k, 2);
        assert_eq!(request.max_chars, 30);
        assert!(request.fallback_to_vl);
        assert_eq!(request.timeout_ms, 20_000);
        assert_eq!(request.resolved_modes().unwrap(), vec![Mode::V, Mode::VL, Mode::VGL]);
    }

    #[test]
    fn slot_serialises_lowercase() {
        assert_eq!(serde_json::to_value(Slot::Findings).unwrap(), serde_json::json!("findings"));
    }
}
