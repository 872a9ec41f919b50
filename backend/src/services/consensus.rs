//! Consensus scoring across reasoning modes.
//!
//! Weighted pairwise Jaccard plus structured-term overlap plus a graph
//! evidence bonus, with modality-conflict penalties and an anchor-mode
//! override for graph-grounded answers.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::models::{
    Confidence, ConsensusResult, ConsensusStatus, FactFinding, Mode, ModeOutput,
};

pub const CONSENSUS_AGREEMENT_THRESHOLD: f64 = 0.6;
pub const CONSENSUS_HIGH_CONFIDENCE_THRESHOLD: f64 = 0.8;

const TEXT_SIMILARITY_WEIGHT: f64 = 0.6;
const STRUCTURED_OVERLAP_WEIGHT: f64 = 0.3;
const GRAPH_EVIDENCE_WEIGHT: f64 = 0.10;

const LOW_CONFIDENCE_PREFIX: &str = "낮은 확신: ";

/// Terms that conflict with a study modality.
fn banned_by_modality(modality: &str) -> &'static [&'static str] {
    match modality {
        "US" => &["gestational", "fetal", "uterus", "ecg"],
        "CT" => &["fetal", "uterus", "ecg"],
        _ => &[],
    }
}

/// Lowercase and squeeze whitespace to normalise free-form text.
pub fn normalise_for_consensus(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let tokens_a: HashSet<&str> = a.split_whitespace().collect();
    let tokens_b: HashSet<&str> = b.split_whitespace().collect();
    if tokens_a.is_empty() && tokens_b.is_empty() {
        return 1.0;
    }
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }
    let intersection = tokens_a.intersection(&tokens_b).count() as f64;
    let union = tokens_a.union(&tokens_b).count() as f64;
    intersection / union
}

/// Negative penalty when the text conflicts with the study modality.
pub fn modality_penalty(text: &str, modality: Option<&str>) -> f64 {
    let Some(modality) = modality else { return 0.0 };
    let lowered = text.to_lowercase();
    let banned = banned_by_modality(&modality.to_uppercase());
    if banned.iter().any(|term| lowered.contains(term)) {
        -0.2
    } else {
        0.0
    }
}

fn preferred_mode(modes: &[Mode]) -> Option<Mode> {
    Mode::PRIORITY
        .iter()
        .copied()
        .find(|mode| modes.contains(mode))
        .or_else(|| modes.first().copied())
}

fn normalise_term(value: &str) -> Option<String> {
    let cleaned =
        value.split_whitespace().collect::<Vec<_>>().join(" ").trim().to_lowercase();
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Expand multi-word terms into their >= 4-char tokens so partial mentions
/// still count.
fn expand_term(term: &str) -> HashSet<String> {
    let mut variants: HashSet<String> = HashSet::new();
    variants.insert(term.to_string());
    if term.contains(' ') {
        for token in term.split_whitespace() {
            if token.chars().count() >= 4 {
                variants.insert(token.to_string());
            }
        }
    }
    variants
}

fn collect_finding_terms(findings: &[FactFinding]) -> (HashSet<String>, HashSet<String>) {
    let mut type_terms = HashSet::new();
    let mut location_terms = HashSet::new();
    for finding in findings {
        if let Some(term) = finding.r#type.as_deref().and_then(normalise_term) {
            type_terms.extend(expand_term(&term));
        }
        if let Some(term) = finding.location.as_deref().and_then(normalise_term) {
            location_terms.extend(expand_term(&term));
        }
    }
    (type_terms, location_terms)
}

fn term_overlap_score(text_lower: &str, terms: &HashSet<String>) -> f64 {
    if text_lower.is_empty() || terms.is_empty() {
        return 0.0;
    }
    let total = terms.len() as f64;
    let hits = terms.iter().filter(|term| text_lower.contains(term.as_str())).count() as f64;
    (hits / total).min(1.0)
}

fn structured_overlap_score(
    text: &str,
    type_terms: &HashSet<String>,
    location_terms: &HashSet<String>,
) -> f64 {
    if text.is_empty() {
        return 0.0;
    }
    let lowered = text.to_lowercase();
    let type_score = term_overlap_score(&lowered, type_terms);
    let location_score = term_overlap_score(&lowered, location_terms);
    (type_score * 0.6 + location_score * 0.4).min(1.0)
}

#[derive(Debug, Clone)]
struct ModeData {
    text: String,
    normalised: String,
    degraded: bool,
    penalty: f64,
    penalty_terms: Vec<String>,
    effective_weight: f64,
    structured_overlap: f64,
}

#[derive(Debug, Clone)]
pub struct ConsensusOptions<'a> {
    pub modality: Option<&'a str>,
    pub weights: HashMap<Mode, f64>,
    pub min_agree: f64,
    pub anchor_mode: Option<Mode>,
    pub anchor_min_score: f64,
    pub structured_findings: &'a [FactFinding],
    pub graph_paths_strength: f64,
}

impl Default for ConsensusOptions<'_> {
    fn default() -> Self {
        Self {
            modality: None,
            weights: HashMap::new(),
            min_agree: 0.35,
            anchor_mode: None,
            anchor_min_score: 0.75,
            structured_findings: &[],
            graph_paths_strength: 0.0,
        }
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

pub fn compute_consensus(
    results: &[(Mode, &ModeOutput)],
    opts: &ConsensusOptions<'_>,
) -> ConsensusResult {
    let modality_key = opts.modality.map(|m| m.to_uppercase());
    let (type_terms, location_terms) = collect_finding_terms(opts.structured_findings);
    let graph_signal = opts.graph_paths_strength.clamp(0.0, 1.0);
    let mut penalised_modes: HashSet<Mode> = HashSet::new();

    let mut available: BTreeMap<Mode, ModeData> = BTreeMap::new();
    for (mode, payload) in results {
        let text = payload.text.trim();
        if text.is_empty() {
            continue;
        }
        let lowered = payload.text.to_lowercase();
        let banned: &[&str] =
            modality_key.as_deref().map(banned_by_modality).unwrap_or(&[]);
        let offending: Vec<String> = banned
            .iter()
            .filter(|term| lowered.contains(*term))
            .map(|term| term.to_string())
            .collect();
        let penalty = modality_penalty(&payload.text, modality_key.as_deref());
        if penalty < 0.0 {
            penalised_modes.insert(*mode);
        }
        let base_weight = opts.weights.get(mode).copied().unwrap_or(1.0);
        available.insert(
            *mode,
            ModeData {
                text: payload.text.clone(),
                normalised: normalise_for_consensus(&payload.text),
                degraded: payload.degraded.is_degraded(),
                penalty,
                penalty_terms: offending,
                effective_weight: (base_weight + penalty).max(0.0),
                structured_overlap: structured_overlap_score(
                    &payload.text,
                    &type_terms,
                    &location_terms,
                ),
            },
        );
    }

    if available.is_empty() {
        return ConsensusResult {
            text: String::new(),
            presented_text: String::new(),
            status: ConsensusStatus::Empty,
            supporting_modes: vec![],
            disagreed_modes: vec![],
            agreement_score: 0.0,
            confidence: Confidence::Low,
            evaluated_modes: vec![],
            degraded_inputs: None,
            notes: None,
        };
    }

    if available.len() == 1 {
        let (mode, data) = available.iter().next().unwrap();
        return ConsensusResult {
            text: data.text.clone(),
            presented_text: data.text.clone(),
            status: ConsensusStatus::Single,
            supporting_modes: vec![*mode],
            disagreed_modes: vec![],
            agreement_score: 1.0,
            confidence: Confidence::Medium,
            evaluated_modes: vec![*mode],
            degraded_inputs: None,
            notes: None,
        };
    }

    // Pair scoring: text similarity + structured-term overlap + graph bonus
    // when VGL participates, then penalties and weighting.
    let modes: Vec<Mode> = available.keys().copied().collect();
    let mut best_pair: Option<(Mode, Mode)> = None;
    let mut best_pair_weight = 1.0_f64;
    let mut best_weighted_score = -1.0_f64;
    let mut best_raw_score = 0.0_f64;
    let mut best_pair_penalty_modes: Vec<Mode> = Vec::new();
    let mut best_pair_graph_bonus = false;
    for i in 0..modes.len() {
        for j in (i + 1)..modes.len() {
            let (mode_a, mode_b) = (modes[i], modes[j]);
            let data_a = &available[&mode_a];
            let data_b = &available[&mode_b];

            let score = jaccard_similarity(&data_a.normalised, &data_b.normalised);
            let pair_weight =
                ((data_a.effective_weight + data_b.effective_weight).max(0.0)) / 2.0;
            let penalty_adjustment =
                (data_a.penalty.min(0.0) + data_b.penalty.min(0.0)) / 2.0;
            let structure_bonus =
                (data_a.structured_overlap + data_b.structured_overlap) / 2.0;
            let pair_has_vgl = mode_a == Mode::VGL || mode_b == Mode::VGL;
            let graph_bonus =
                if pair_has_vgl { GRAPH_EVIDENCE_WEIGHT * graph_signal } else { 0.0 };

            let raw_score = score * TEXT_SIMILARITY_WEIGHT
                + structure_bonus * STRUCTURED_OVERLAP_WEIGHT
                + graph_bonus;
            let adjusted_score = (raw_score + penalty_adjustment).clamp(0.0, 1.0);
            let weighted_score = adjusted_score * pair_weight;

            if weighted_score > best_weighted_score {
                best_weighted_score = weighted_score;
                best_pair = Some((mode_a, mode_b));
                best_raw_score = adjusted_score;
                best_pair_weight = pair_weight;
                best_pair_penalty_modes = [mode_a, mode_b]
                    .into_iter()
                    .filter(|mode| available[mode].penalty < 0.0)
                    .collect();
                best_pair_graph_bonus = graph_bonus > 0.0;
            }
        }
    }

    let mut agreement_score = best_raw_score.max(0.0);
    let mut supporting_modes: Vec<Mode> = Vec::new();
    let mut fallback_used = false;
    if let Some((mode_a, mode_b)) = best_pair {
        let mut pair = vec![mode_a, mode_b];
        pair.sort_by_key(|mode| mode.priority_rank());
        if agreement_score >= CONSENSUS_AGREEMENT_THRESHOLD {
            supporting_modes = pair;
        } else if agreement_score >= opts.min_agree && best_pair_weight > 1.0 {
            supporting_modes = pair;
            fallback_used = true;
        }
    }

    let mut penalty_note: Option<String> = None;
    let mut anchor_mode_used = false;
    if supporting_modes.is_empty() {
        if let Some(anchor) = opts.anchor_mode {
            if let Some(anchor_data) = available.get(&anchor) {
                if !anchor_data.degraded {
                    supporting_modes = vec![anchor];
                    anchor_mode_used = true;
                    agreement_score = agreement_score.max(opts.anchor_min_score);
                }
            }
        }
    }

    if !supporting_modes.is_empty() {
        let conflicted: Vec<Mode> = supporting_modes
            .iter()
            .copied()
            .filter(|mode| available[mode].penalty < 0.0)
            .collect();
        if !conflicted.is_empty() {
            penalty_note = Some(format!(
                "modality conflict: {}",
                conflicted.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(", ")
            ));
            supporting_modes.retain(|mode| available[mode].penalty >= 0.0);
        }
    } else if !best_pair_penalty_modes.is_empty() {
        penalty_note = Some(format!(
            "modality conflict: {}",
            best_pair_penalty_modes
                .iter()
                .map(|m| m.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    let mut notes: Option<String> = None;
    let consensus_text: String;
    let status: ConsensusStatus;
    let mut confidence: Confidence;
    if !supporting_modes.is_empty() {
        let preferred = preferred_mode(&supporting_modes).unwrap_or(supporting_modes[0]);
        consensus_text = available[&preferred].text.clone();
        status = ConsensusStatus::Agree;
        if anchor_mode_used {
            confidence = if agreement_score >= CONSENSUS_HIGH_CONFIDENCE_THRESHOLD {
                Confidence::High
            } else {
                Confidence::Medium
            };
            notes = Some("graph-grounded mode dominated consensus".to_string());
        } else if agreement_score >= CONSENSUS_HIGH_CONFIDENCE_THRESHOLD {
            confidence = Confidence::High;
            notes = Some("agreement across requested modes".to_string());
        } else if fallback_used {
            confidence = Confidence::Medium;
            notes = Some("weighted agreement favouring grounded evidence".to_string());
        } else {
            confidence = Confidence::Medium;
            notes = Some("agreement across requested modes".to_string());
        }
    } else {
        let all_modes: Vec<Mode> = available.keys().copied().collect();
        let preferred = preferred_mode(&all_modes).unwrap_or(all_modes[0]);
        consensus_text = available[&preferred].text.clone();
        confidence = Confidence::Low;
        status = ConsensusStatus::Disagree;
        supporting_modes = vec![preferred];
        notes = Some("outputs diverged across modes".to_string());
        if available[&preferred].penalty < 0.0 {
            let terms = &available[&preferred].penalty_terms;
            let detail_terms = if terms.is_empty() {
                "unexpected content".to_string()
            } else {
                let mut sorted: Vec<&String> = terms.iter().collect();
                sorted.sort();
                sorted.dedup();
                sorted.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            };
            let penalty_detail = format!("penalised terms: {}", detail_terms);
            penalty_note = Some(match penalty_note {
                Some(existing) => format!("{} | {}", existing, penalty_detail),
                None => penalty_detail,
            });
            confidence = Confidence::VeryLow;
        }
    }

    let mut disagreed_modes: Vec<Mode> = available
        .keys()
        .copied()
        .filter(|mode| !supporting_modes.contains(mode))
        .collect();
    disagreed_modes.sort();
    let degraded_inputs: Vec<Mode> = available
        .iter()
        .filter(|(_, data)| data.degraded)
        .map(|(mode, _)| *mode)
        .collect();
    let presented_text = if status == ConsensusStatus::Disagree {
        format!("{}{}", LOW_CONFIDENCE_PREFIX, consensus_text)
    } else {
        consensus_text.clone()
    };

    let mut all_notes: Vec<String> = Vec::new();
    if let Some(note) = notes {
        all_notes.push(note);
    }
    if let Some(note) = penalty_note.clone() {
        all_notes.push(note);
    }
    if status != ConsensusStatus::Disagree {
        let structured_alignment = supporting_modes
            .iter()
            .any(|mode| available[mode].structured_overlap >= 0.5);
        if structured_alignment {
            all_notes.push("structured finding terms aligned across agreeing modes".to_string());
        }
        if graph_signal > 0.0
            && (supporting_modes.contains(&Mode::VGL) || best_pair_graph_bonus)
        {
            all_notes
                .push(format!("graph evidence boosted consensus (paths_signal={:.2})", graph_signal));
        }
    }
    if !penalised_modes.is_empty() && status != ConsensusStatus::Disagree && penalty_note.is_none()
    {
        all_notes.push("penalty applied for modality conflict".to_string());
    }

    ConsensusResult {
        text: consensus_text,
        presented_text,
        status,
        supporting_modes,
        disagreed_modes,
        agreement_score: round3(agreement_score),
        confidence,
        evaluated_modes: available.keys().copied().collect(),
        degraded_inputs: (!degraded_inputs.is_empty()).then_some(degraded_inputs),
        notes: (!all_notes.is_empty()).then(|| all_notes.join(" | ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Degraded;

    fn output(text: &str) -> ModeOutput {
        ModeOutput { text: text.to_string(), latency_ms: 1, ..Default::default() }
    }

    fn degraded_output(text: &str) -> ModeOutput {
        ModeOutput { text: text.to_string(), latency_ms: 1, degraded: Degraded::Vl, ..Default::default() }
    }

    fn findings(kind: &str, location: &str) -> Vec<FactFinding> {
        vec![FactFinding {
            id: Some("f_1".to_string()),
            r#type: Some(kind.to_string()),
            location: Some(location.to_string()),
            size_cm: None,
            conf: Some(0.85),
        }]
    }

    #[test]
    fn empty_results_yield_empty_status() {
        let result = compute_consensus(&[], &ConsensusOptions::default());
        assert_eq!(result.status, ConsensusStatus::Empty);
        assert_eq!(result.confidence, Confidence::Low);
    }

    #[test]
    fn single_mode_is_single_status() {
        let v = output("nodule in right middle lobe");
        let result =
            compute_consensus(&[(Mode::V, &v)], &ConsensusOptions::default());
        assert_eq!(result.status, ConsensusStatus::Single);
        assert_eq!(result.agreement_score, 1.0);
        assert_eq!(result.supporting_modes, vec![Mode::V]);
    }

    #[test]
    fn identical_texts_agree_with_high_confidence() {
        let a = output("nodule in right middle lobe");
        let b = output("nodule in right middle lobe");
        let opts = ConsensusOptions {
            structured_findings: &findings("nodule", "right middle lobe"),
            ..Default::default()
        };
        let result = compute_consensus(&[(Mode::V, &a), (Mode::VL, &b)], &opts);
        assert_eq!(result.status, ConsensusStatus::Agree);
        assert_eq!(result.confidence, Confidence::High);
        assert!(result.notes.as_deref().unwrap().contains("agreement across requested modes"));
    }

    #[test]
    fn graph_strength_is_monotonic_for_vgl_pairs() {
        let a = output("nodule right middle lobe");
        let b = output("nodule noted in right middle lobe region");
        let structured = findings("nodule", "right middle lobe");
        let score_at = |strength: f64| {
            let opts = ConsensusOptions {
                structured_findings: &structured,
                graph_paths_strength: strength,
                ..Default::default()
            };
            compute_consensus(&[(Mode::VL, &a), (Mode::VGL, &b)], &opts).agreement_score
        };
        assert!(score_at(1.0) >= score_at(0.5));
        assert!(score_at(0.5) >= score_at(0.0));
    }

    #[test]
    fn anchor_mode_lifts_agreement() {
        let v = output("completely unrelated text about weather");
        let vgl = output("nodule in right middle lobe");
        let opts = ConsensusOptions {
            anchor_mode: Some(Mode::VGL),
            ..Default::default()
        };
        let result = compute_consensus(&[(Mode::V, &v), (Mode::VGL, &vgl)], &opts);
        assert_eq!(result.status, ConsensusStatus::Agree);
        assert_eq!(result.supporting_modes, vec![Mode::VGL]);
        assert!(result.agreement_score >= 0.75);
        assert!(result.notes.as_deref().unwrap().contains("graph-grounded mode dominated"));
    }

    #[test]
    fn degraded_anchor_is_not_used() {
        let v = output("completely unrelated text about weather");
        let vgl = degraded_output("nodule in right middle lobe");
        let opts = ConsensusOptions {
            anchor_mode: Some(Mode::VGL),
            ..Default::default()
        };
        let result = compute_consensus(&[(Mode::V, &v), (Mode::VGL, &vgl)], &opts);
        assert_eq!(result.status, ConsensusStatus::Disagree);
        assert_eq!(result.degraded_inputs, Some(vec![Mode::VGL]));
        assert!(result.presented_text.starts_with("낮은 확신: "));
    }

    #[test]
    fn modality_conflict_penalises_and_notes() {
        let v = output("gestational sac visualised");
        let vl = output("normal cardiac silhouette on review");
        let opts = ConsensusOptions { modality: Some("US"), ..Default::default() };
        let result = compute_consensus(&[(Mode::V, &v), (Mode::VL, &vl)], &opts);
        let notes = result.notes.unwrap_or_default();
        assert!(notes.contains("modality conflict") || notes.contains("penalised terms"));
        // a penalised mode never supports consensus without an attached note
        if result.supporting_modes.contains(&Mode::V) {
            assert!(notes.contains("modality conflict") || notes.contains("penalised terms"));
        }
    }

    #[test]
    fn disagreement_prefers_vgl_and_prefixes_presented_text() {
        let v = output("alpha beta gamma");
        let vl = output("delta epsilon zeta");
        let vgl = output("eta theta iota");
        let result = compute_consensus(
            &[(Mode::V, &v), (Mode::VL, &vl), (Mode::VGL, &vgl)],
            &ConsensusOptions::default(),
        );
        assert_eq!(result.status, ConsensusStatus::Disagree);
        assert_eq!(result.supporting_modes, vec![Mode::VGL]);
        assert_eq!(result.confidence, Confidence::Low);
        assert!(result.presented_text.starts_with("낮은 확신: "));
        assert_eq!(result.disagreed_modes, vec![Mode::V, Mode::VL]);
    }

    #[test]
    fn weighted_pair_passes_fallback_threshold() {
        // Moderate overlap below 0.6 but above min_agree, boosted weights.
        let vl = output("nodule right middle lobe present");
        let vgl = output("nodule right middle lobe with small size");
        let mut weights = HashMap::new();
        weights.insert(Mode::VL, 1.2);
        weights.insert(Mode::VGL, 1.8);
        let structured = findings("nodule", "right middle lobe");
        let opts = ConsensusOptions {
            weights,
            structured_findings: &structured,
            ..Default::default()
        };
        let result = compute_consensus(&[(Mode::VL, &vl), (Mode::VGL, &vgl)], &opts);
        assert_eq!(result.status, ConsensusStatus::Agree);
    }
}
