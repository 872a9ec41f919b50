//! Shared helpers for normalising VLM caption outputs into a typed fact
//! bundle: stable ids, finding fallback, confidence clamping and the
//! debug-only bundle cache.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::path::Path;

use crate::models::{
    FallbackMeta, FindingRecord, ImageRecord, NormalizedBundle, ReportRecord,
};
use crate::services::dummy_registry::DummyRegistry;
use crate::services::vlm_runner::{VlmService, VlmTask};
use crate::utils::{ApiError, ApiResult};

/// Caption keywords mapped to finding types (English + Korean aliases).
static KEYWORD_MAP: &[(&str, &str)] =
    &[("nodule", "nodule"), ("결절", "nodule"), ("opacity", "opacity"), ("음영", "opacity")];

/// Lobe codes mapped to anatomy labels.
static LOBE_MAP: &[(&str, &str)] = &[
    ("rul", "right upper lobe"),
    ("rml", "right middle lobe"),
    ("rll", "right lower lobe"),
    ("lul", "left upper lobe"),
    ("lll", "left lower lobe"),
];

static JSON_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").unwrap());
static SIZE_CM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*cm").unwrap());
static LOBE_CODES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    LOBE_MAP
        .iter()
        .map(|(code, label)| {
            (Regex::new(&format!(r"(?i)\b{}\b", code)).unwrap(), *label)
        })
        .collect()
});

/// Robust instruction that forces JSON responses from the VLM.
pub fn force_json_prompt() -> String {
    concat!(
        "You are a radiology assistant.",
        " Respond ONLY with JSON using this schema: {",
        "\"image\":{\"modality\":\"XR|CT|MR\", \"image_id\":\"string?\"},",
        "\"report\":{\"id\":\"string?\",\"text\":\"string\",\"model\":\"string?\",\"conf\":0-1,\"ts\":\"iso?\"},",
        "\"findings\":[{\"id\":\"string?\",\"type\":\"string\",\"location\":\"string?\",\"size_cm\":number?,",
        "\"conf\":0-1?}],\"caption\":\"string\",\"caption_ko\":\"string?\"}. ",
        "Ensure valid JSON with double quotes."
    )
    .to_string()
}

fn sha1_hex(seed: &str) -> String {
    hex::encode(Sha1::digest(seed.as_bytes()))
}

pub fn derive_image_id(file_path: &str) -> String {
    format!("IMG_{}", &sha1_hex(file_path)[..8])
}

pub fn derive_report_id(image_id: &str, text: &str, model: Option<&str>) -> String {
    let key_text: String = text.chars().take(256).collect();
    let seed = format!("{}|{}|{}", image_id, key_text, model.unwrap_or(""));
    format!("R_{}", &sha1_hex(&seed)[..12])
}

pub fn derive_finding_id(
    image_id: &str,
    finding_type: Option<&str>,
    location: Option<&str>,
    size_cm: Option<f64>,
) -> String {
    let size_component = match size_cm {
        Some(size) => format!("{:.1}", (size * 10.0).round() / 10.0),
        None => "na".to_string(),
    };
    let seed = [
        image_id.trim().to_lowercase(),
        finding_type.unwrap_or("").trim().to_lowercase(),
        location.unwrap_or("").trim().to_lowercase(),
        size_component,
    ]
    .join("|");
    format!("f_{}", &sha1_hex(&seed)[..12])
}

/// Squeeze whitespace and clamp to `max_chars` characters.
pub fn clamp_one_line(text: &str, max_chars: usize) -> String {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if max_chars == 0 {
        return cleaned;
    }
    cleaned.chars().take(max_chars).collect()
}

/// Parse either a pure JSON body or the first `{...}` substring. Anything
/// unreadable collapses to an empty object.
pub fn parse_json_output(output: &str) -> Value {
    let text = output.trim();
    if text.is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
        return Value::Object(map);
    }
    if let Some(m) = JSON_BLOCK.find(text) {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(m.as_str()) {
            return Value::Object(map);
        }
    }
    Value::Object(serde_json::Map::new())
}

fn coerce_float(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn clamp_conf(value: Option<&Value>) -> Option<f64> {
    coerce_float(value).map(|conf| conf.clamp(0.0, 1.0))
}

fn round_size(size: f64) -> f64 {
    (size * 10.0).round() / 10.0
}

/// Normalise raw finding payloads: derived ids, clamped conf, rounded size.
fn normalise_raw_findings(raw_findings: &[Value], image_id: &str) -> Vec<FindingRecord> {
    let mut findings = Vec::new();
    for item in raw_findings {
        let Some(map) = item.as_object() else { continue };
        let finding_type = map.get("type").and_then(Value::as_str).map(str::to_string);
        let location = map.get("location").and_then(Value::as_str).map(str::to_string);
        let size_cm = coerce_float(map.get("size_cm")).map(round_size);
        let conf = clamp_conf(map.get("conf"));
        let id = map
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                derive_finding_id(image_id, finding_type.as_deref(), location.as_deref(), size_cm)
            });
        let source = map.get("source").and_then(Value::as_str).map(str::to_string);
        findings.push(FindingRecord { id, r#type: finding_type, location, size_cm, conf, source });
    }
    findings
}

fn normalise_records(records: &[FindingRecord], image_id: &str) -> Vec<FindingRecord> {
    records
        .iter()
        .map(|record| {
            let mut clean = record.clone();
            clean.size_cm = clean.size_cm.map(round_size);
            clean.conf = clean.conf.map(|conf| conf.clamp(0.0, 1.0));
            if clean.id.is_empty() {
                clean.id = derive_finding_id(
                    image_id,
                    clean.r#type.as_deref(),
                    clean.location.as_deref(),
                    clean.size_cm,
                );
            }
            clean
        })
        .collect()
}

/// Generate fallback findings, reporting whether the seeded registry hit.
pub fn fallback_findings_from_caption(
    caption: &str,
    image_id: Option<&str>,
    registry: &DummyRegistry,
) -> (Vec<FindingRecord>, bool) {
    if let Some(id) = image_id {
        let seeded = registry.resolve_findings(id);
        if !seeded.is_empty() {
            return (seeded, true);
        }
    }

    let text = caption.trim();
    if text.is_empty() {
        return (Vec::new(), false);
    }

    let lowered = text.to_lowercase();
    let Some(finding_type) = KEYWORD_MAP
        .iter()
        .find(|(keyword, _)| lowered.contains(keyword) || text.contains(keyword))
        .map(|(_, normalised)| normalised.to_string())
    else {
        return (Vec::new(), false);
    };

    let location = LOBE_CODES
        .iter()
        .find(|(pattern, label)| pattern.is_match(text) || lowered.contains(label))
        .map(|(_, label)| label.to_string());

    let size_cm = SIZE_CM
        .captures(text)
        .and_then(|captures| captures[1].parse::<f64>().ok())
        .map(round_size);

    (
        vec![FindingRecord {
            id: String::new(),
            r#type: Some(finding_type),
            location,
            size_cm,
            conf: Some(0.5),
            source: Some("caption_keywords".to_string()),
        }],
        false,
    )
}

/// Cache key for a normalised bundle. Includes the force flag so forced and
/// non-forced runs never share a file.
pub fn cache_file_name(seed: &str, force_dummy_fallback: bool) -> String {
    let digest = sha1_hex(&format!("{}|force={}", seed, force_dummy_fallback));
    format!("normalized_{}.json", digest)
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions<'a> {
    pub image_id: Option<&'a str>,
    pub force_dummy_fallback: bool,
    pub cache_seed: Option<&'a str>,
    pub cache_dir: Option<&'a Path>,
}

/// Call the VLM and return the normalised bundle shared across endpoints.
pub async fn normalize_from_vlm(
    vlm: &dyn VlmService,
    registry: &DummyRegistry,
    file_path: &Path,
    opts: NormalizeOptions<'_>,
) -> ApiResult<NormalizedBundle> {
    if !file_path.exists() {
        return Err(ApiError::invalid_input(format!(
            "file_path does not exist: {}",
            file_path.display()
        )));
    }

    let cache_path = match (opts.cache_dir, opts.cache_seed) {
        (Some(dir), Some(seed)) => {
            Some(dir.join(cache_file_name(seed, opts.force_dummy_fallback)))
        },
        _ => None,
    };
    if let Some(path) = cache_path.as_deref() {
        if path.exists() {
            if let Ok(content) = std::fs::read_to_string(path) {
                if let Ok(mut bundle) = serde_json::from_str::<NormalizedBundle>(&content) {
                    tracing::debug!("normaliser cache hit: {}", path.display());
                    bundle.raw_vlm = serde_json::json!({ "cached": true });
                    return Ok(bundle);
                }
            }
        }
    }

    let image_bytes = std::fs::read(file_path)
        .map_err(|e| ApiError::invalid_input(format!("failed to read file: {}", e)))?;

    let generation =
        vlm.generate(&image_bytes, &force_json_prompt(), VlmTask::Caption, 0.2).await?;
    let bundle = normalize_vlm_output(
        &generation.output,
        &generation.model,
        generation.latency_ms,
        file_path,
        opts.image_id,
        opts.force_dummy_fallback,
        registry,
    );

    if let Some(path) = cache_path.as_deref() {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string(&bundle) {
            Ok(serialised) => {
                if let Err(e) = std::fs::write(path, serialised) {
                    tracing::warn!("failed to write normaliser cache {}: {}", path.display(), e);
                }
            },
            Err(e) => tracing::warn!("failed to serialise normaliser cache: {}", e),
        }
    }

    Ok(bundle)
}

/// Pure normalisation core: VLM text output -> typed bundle.
#[allow(clippy::too_many_arguments)]
pub fn normalize_vlm_output(
    output: &str,
    vlm_model: &str,
    vlm_latency_ms: u64,
    file_path: &Path,
    image_id: Option<&str>,
    force_dummy_fallback: bool,
    registry: &DummyRegistry,
) -> NormalizedBundle {
    let parsed = parse_json_output(output);

    let image_payload = parsed.get("image").and_then(Value::as_object);
    let resolved_image_id = image_id
        .map(str::to_string)
        .or_else(|| {
            image_payload
                .and_then(|map| map.get("image_id"))
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| derive_image_id(&file_path.display().to_string()));

    let modality = image_payload
        .and_then(|map| map.get("modality"))
        .or_else(|| parsed.get("modality"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let report_block = parsed.get("report").and_then(Value::as_object);
    let caption_text = parsed
        .get("caption")
        .and_then(Value::as_str)
        .or_else(|| report_block.and_then(|map| map.get("text")).and_then(Value::as_str))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| output.trim())
        .to_string();

    let model_name = report_block
        .and_then(|map| map.get("model"))
        .and_then(Value::as_str)
        .filter(|model| !model.is_empty())
        .unwrap_or(vlm_model)
        .to_string();

    let report_conf = report_block
        .and_then(|map| clamp_conf(map.get("conf")))
        .or_else(|| clamp_conf(parsed.get("confidence")))
        .unwrap_or(0.8);

    let report_ts = report_block
        .and_then(|map| map.get("ts"))
        .and_then(Value::as_str)
        .filter(|ts| !ts.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Utc::now().to_rfc3339());

    let report_id = report_block
        .and_then(|map| map.get("id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            derive_report_id(&resolved_image_id, &caption_text, Some(&model_name))
        });

    let findings_raw: Vec<Value> = parsed
        .get("findings")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut findings = normalise_raw_findings(&findings_raw, &resolved_image_id);

    let mut fallback_used = false;
    let mut fallback_registry_hit = false;
    let mut fallback_strategy: Option<String> = None;
    if findings.is_empty() || force_dummy_fallback {
        let (candidates, registry_hit) =
            fallback_findings_from_caption(&caption_text, Some(&resolved_image_id), registry);
        fallback_registry_hit = registry_hit;
        if !candidates.is_empty() {
            fallback_strategy = if registry_hit {
                Some("mock_seed".to_string())
            } else {
                candidates[0].source.clone().or_else(|| Some("caption_keywords".to_string()))
            };
            findings = normalise_records(&candidates, &resolved_image_id);
            fallback_used = true;
        }
    }

    let caption_ko = parsed
        .get("caption_ko")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(|text| clamp_one_line(text, 120));

    NormalizedBundle {
        image: ImageRecord {
            image_id: Some(resolved_image_id),
            path: Some(file_path.display().to_string()),
            modality,
            storage_uri: None,
            storage_uri_key: None,
        },
        report: ReportRecord {
            id: report_id,
            text: caption_text.clone(),
            model: Some(model_name),
            conf: report_conf,
            ts: report_ts,
        },
        findings,
        caption: caption_text,
        caption_ko,
        vlm_latency_ms,
        raw_vlm: serde_json::json!({
            "output": output,
            "model": vlm_model,
            "latency_ms": vlm_latency_ms,
        }),
        finding_fallback: FallbackMeta {
            used: fallback_used,
            forced: force_dummy_fallback,
            strategy: fallback_strategy,
            registry_hit: fallback_registry_hit,
            seeded_ids: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_registry() -> DummyRegistry {
        DummyRegistry::default()
    }

    #[test]
    fn parse_handles_fenced_json() {
        let output = "Here you go:\n{\"caption\": \"nodule in RML\"}\nthanks";
        let parsed = parse_json_output(output);
        assert_eq!(parsed["caption"], "nodule in RML");
        assert_eq!(parse_json_output("not json at all"), serde_json::json!({}));
    }

    #[test]
    fn derived_ids_are_stable() {
        assert_eq!(derive_image_id("/tmp/a.png"), derive_image_id("/tmp/a.png"));
        assert_eq!(
            derive_finding_id("IMG_001", Some("Nodule"), Some("RML"), Some(1.23)),
            derive_finding_id("img_001", Some("nodule"), Some("rml"), Some(1.2)),
        );
        assert_ne!(
            derive_report_id("IMG_001", "a", None),
            derive_report_id("IMG_001", "b", None)
        );
    }

    #[test]
    fn caption_fallback_extracts_type_location_size() {
        let registry = empty_registry();
        let (findings, registry_hit) = fallback_findings_from_caption(
            "1.5 cm nodule in the RML",
            Some("IMG_XYZ"),
            &registry,
        );
        assert!(!registry_hit);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].r#type.as_deref(), Some("nodule"));
        assert_eq!(findings[0].location.as_deref(), Some("right middle lobe"));
        assert_eq!(findings[0].size_cm, Some(1.5));
        assert_eq!(findings[0].source.as_deref(), Some("caption_keywords"));
    }

    #[test]
    fn korean_keywords_match() {
        let registry = empty_registry();
        let (findings, _) =
            fallback_findings_from_caption("우상엽 결절 소견", Some("IMG_XYZ"), &registry);
        assert_eq!(findings[0].r#type.as_deref(), Some("nodule"));
    }

    #[test]
    fn caption_without_keywords_yields_nothing() {
        let registry = empty_registry();
        let (findings, _) =
            fallback_findings_from_caption("unremarkable study", Some("IMG_XYZ"), &registry);
        assert!(findings.is_empty());
    }

    #[test]
    fn cache_key_differs_by_force_flag() {
        let plain = cache_file_name("/tmp/a.png", false);
        let forced = cache_file_name("/tmp/a.png", true);
        assert_ne!(plain, forced);
        assert!(plain.starts_with("normalized_") && plain.ends_with(".json"));
    }

    #[test]
    fn normalize_output_prefers_payload_image_id() {
        let registry = empty_registry();
        let output = r#"{"image":{"image_id":"IMG_PARSED","modality":"XR"},
            "caption":"nodule in RML","findings":[{"type":"nodule","location":"rml","conf":1.7}]}"#;
        let bundle = normalize_vlm_output(
            output,
            "qwen2-vl",
            12,
            Path::new("/tmp/x.png"),
            Some("IMG_001"),
            false,
            &registry,
        );
        assert_eq!(bundle.image.image_id.as_deref(), Some("IMG_001"));
        assert_eq!(bundle.findings[0].conf, Some(1.0));
        assert!(!bundle.finding_fallback.used);
        assert!(bundle.findings[0].id.starts_with("f_"));
    }

    #[test]
    fn empty_findings_trigger_caption_fallback() {
        let registry = empty_registry();
        let bundle = normalize_vlm_output(
            r#"{"caption":"2 cm opacity in LLL"}"#,
            "qwen2-vl",
            5,
            Path::new("/tmp/x.png"),
            None,
            false,
            &registry,
        );
        assert!(bundle.finding_fallback.used);
        assert_eq!(bundle.finding_fallback.strategy.as_deref(), Some("caption_keywords"));
        assert!(!bundle.finding_fallback.registry_hit);
        assert_eq!(bundle.findings[0].r#type.as_deref(), Some("opacity"));
    }

    #[test]
    fn unparseable_output_becomes_caption() {
        let registry = empty_registry();
        let bundle = normalize_vlm_output(
            "plain caption text",
            "qwen2-vl",
            5,
            Path::new("/tmp/x.png"),
            None,
            false,
            &registry,
        );
        assert_eq!(bundle.caption, "plain caption text");
        assert_eq!(bundle.report.conf, 0.8);
        assert!(bundle.image.image_id.as_deref().unwrap().starts_with("IMG_"));
    }
}
