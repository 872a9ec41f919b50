//! Lightweight similarity scoring between the request image and seeded
//! graph images, based on modality and finding-token overlap.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::models::{FindingRecord, SimilarImage, SimilarityEdge};

static TOKEN_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Candidate row fetched from the graph for similarity scoring.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimilarityCandidate {
    pub image_id: String,
    #[serde(default)]
    pub modality: Option<String>,
    #[serde(default)]
    pub finding_types: Vec<String>,
    #[serde(default)]
    pub finding_locations: Vec<String>,
    #[serde(default)]
    pub anatomy_codes: Vec<String>,
}

fn normalise_token(value: &str) -> Option<String> {
    let token = TOKEN_PATTERN
        .replace_all(value.trim().to_lowercase().as_str(), "_")
        .trim_matches('_')
        .to_string();
    (!token.is_empty()).then_some(token)
}

fn collect_tokens<'a>(values: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
    values.into_iter().filter_map(normalise_token).collect()
}

fn extract_finding_tokens(findings: &[FindingRecord]) -> (HashSet<String>, HashSet<String>) {
    let mut types = HashSet::new();
    let mut locations = HashSet::new();
    for finding in findings {
        if let Some(kind) = finding.r#type.as_deref().and_then(normalise_token) {
            types.insert(kind);
        }
        if let Some(location) = finding.location.as_deref().and_then(normalise_token) {
            locations.insert(location);
        }
    }
    (types, locations)
}

/// Return `(edges, summary)` for candidates whose score meets the threshold.
///
/// The summary list is intended for API payloads, while the edges list is
/// suitable for graph upserts. Both lists are sorted by score (descending)
/// then image_id.
pub fn compute_similarity_scores(
    modality: Option<&str>,
    findings: &[FindingRecord],
    candidates: &[SimilarityCandidate],
    threshold: f64,
    top_k: usize,
) -> (Vec<SimilarityEdge>, Vec<SimilarImage>) {
    let modality = modality.map(|m| m.trim().to_uppercase()).unwrap_or_default();
    let (new_types, new_locations) = extract_finding_tokens(findings);
    let new_semantic_tokens: HashSet<String> =
        new_types.union(&new_locations).cloned().collect();

    let mut scored: Vec<(f64, String, Vec<&'static str>)> = Vec::new();
    for candidate in candidates {
        if candidate.image_id.is_empty() {
            continue;
        }

        let candidate_modality =
            candidate.modality.as_deref().map(|m| m.trim().to_uppercase()).unwrap_or_default();
        let modality_match = !modality.is_empty() && modality == candidate_modality;

        let candidate_types = collect_tokens(candidate.finding_types.iter().map(|s| s.as_str()));
        let candidate_locations =
            collect_tokens(candidate.finding_locations.iter().map(|s| s.as_str()));
        let candidate_anatomy =
            collect_tokens(candidate.anatomy_codes.iter().map(|s| s.as_str()));

        let mut semantic_components: Vec<&'static str> = Vec::new();
        if new_types.intersection(&candidate_types).next().is_some() {
            semantic_components.push("finding_type");
        }
        if new_locations.intersection(&candidate_locations).next().is_some() {
            semantic_components.push("location");
        }
        if new_semantic_tokens.intersection(&candidate_anatomy).next().is_some() {
            semantic_components.push("anatomy");
        }

        let modality_score: f64 = if modality_match { 1.0 } else { 0.0 };
        let semantics_score: f64 = if semantic_components.is_empty() { 0.0 } else { 1.0 };
        let score =
            ((0.6 * modality_score + 0.4 * semantics_score) * 1000.0).round() / 1000.0;
        if score < threshold {
            continue;
        }

        let mut basis_parts: Vec<&'static str> = Vec::new();
        if modality_match {
            basis_parts.push("modality");
        }
        basis_parts.extend(semantic_components);
        if basis_parts.is_empty() {
            basis_parts.push("none");
        }

        scored.push((score, candidate.image_id.clone(), basis_parts));
    }

    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.cmp(&b.1))
    });
    scored.truncate(top_k);

    let summary = scored
        .iter()
        .map(|(score, id, _)| SimilarImage { id: id.clone(), score: *score })
        .collect();
    let edges = scored
        .into_iter()
        .map(|(score, image_id, basis_parts)| SimilarityEdge {
            image_id,
            score,
            basis: basis_parts.join("+"),
        })
        .collect();

    (edges, summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(kind: &str, location: &str) -> FindingRecord {
        FindingRecord {
            id: "f_1".to_string(),
            r#type: Some(kind.to_string()),
            location: Some(location.to_string()),
            size_cm: None,
            conf: Some(0.8),
            source: None,
        }
    }

    fn candidate(id: &str, modality: &str, types: &[&str]) -> SimilarityCandidate {
        SimilarityCandidate {
            image_id: id.to_string(),
            modality: Some(modality.to_string()),
            finding_types: types.iter().map(|s| s.to_string()).collect(),
            finding_locations: vec![],
            anatomy_codes: vec![],
        }
    }

    #[test]
    fn modality_and_semantics_both_score() {
        let findings = vec![finding("Nodule", "Right middle lobe")];
        let candidates = vec![candidate("IMG_002", "XR", &["Nodule"])];
        let (edges, summary) =
            compute_similarity_scores(Some("XR"), &findings, &candidates, 0.5, 10);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].score, 1.0);
        assert_eq!(edges[0].basis, "modality+finding_type");
        assert_eq!(summary[0].id, "IMG_002");
    }

    #[test]
    fn below_threshold_candidates_are_dropped() {
        let findings = vec![finding("Nodule", "Right middle lobe")];
        let candidates = vec![candidate("IMG_003", "CT", &["Mass"])];
        let (edges, _) = compute_similarity_scores(Some("XR"), &findings, &candidates, 0.5, 10);
        assert!(edges.is_empty());
    }

    #[test]
    fn results_sorted_by_score_then_id() {
        let findings = vec![finding("Nodule", "Right middle lobe")];
        let candidates = vec![
            candidate("IMG_B", "XR", &[]),
            candidate("IMG_A", "XR", &[]),
            candidate("IMG_C", "XR", &["Nodule"]),
        ];
        let (edges, _) = compute_similarity_scores(Some("XR"), &findings, &candidates, 0.5, 10);
        assert_eq!(
            edges.iter().map(|e| e.image_id.as_str()).collect::<Vec<_>>(),
            vec!["IMG_C", "IMG_A", "IMG_B"]
        );
    }

    #[test]
    fn top_k_caps_results() {
        let findings = vec![finding("Nodule", "Right middle lobe")];
        let candidates: Vec<_> =
            (0..5).map(|i| candidate(&format!("IMG_{i:03}"), "XR", &[])).collect();
        let (edges, _) = compute_similarity_scores(Some("XR"), &findings, &candidates, 0.5, 2);
        assert_eq!(edges.len(), 2);
    }
}
