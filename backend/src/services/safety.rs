//! Post-consensus organ-mismatch guard.
//!
//! Infers the expected organ from the file path and downgrades the
//! consensus when the answer mentions a different organ.

use crate::models::{Confidence, ConsensusResult, ConsensusStatus};

const ORGAN_KEYWORDS: &[(&str, &[&str])] = &[
    ("brain", &["brain", "cerebral", "stroke", "infarct"]),
    ("liver", &["liver", "hepatic"]),
    ("lung", &["lung", "pulmonary"]),
    ("heart", &["heart", "cardiac"]),
];

pub const GUARD_DISCLAIMER: &str = "낮은 확신: 장기 불일치 가능성이 있어 단정이 어렵습니다.";

/// Infer the expected organ from filename tokens.
pub fn infer_expected_organ(file_path: Option<&str>) -> Option<&'static str> {
    let path_lower = file_path?.to_lowercase();
    if path_lower.contains("brain") || path_lower.contains("head") {
        return Some("brain");
    }
    if path_lower.contains("liver") || path_lower.contains("abdomen") {
        return Some("liver");
    }
    if path_lower.contains("chest") {
        return Some("lung");
    }
    None
}

/// Scan the consensus text for cross-organ keywords; any hit downgrades the
/// result to a low-confidence disagreement with a fixed disclaimer.
pub fn apply_organ_guard(consensus: &mut ConsensusResult, expected_organ: &str) -> bool {
    let text_lower = consensus.text.to_lowercase();
    let mut offending: Vec<&str> = Vec::new();
    for (organ, keywords) in ORGAN_KEYWORDS {
        if *organ == expected_organ {
            continue;
        }
        if keywords.iter().any(|keyword| text_lower.contains(keyword)) {
            offending.push(organ);
        }
    }
    if offending.is_empty() {
        return false;
    }

    consensus.status = ConsensusStatus::Disagree;
    consensus.confidence = Confidence::VeryLow;
    let guard_note = format!(
        "Guard: {:?} terms inconsistent with expected {}",
        offending, expected_organ
    );
    consensus.notes = Some(match consensus.notes.take() {
        Some(existing) => format!("{} | {}", existing, guard_note),
        None => guard_note,
    });
    consensus.presented_text = GUARD_DISCLAIMER.to_string();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Mode;

    fn consensus(text: &str) -> ConsensusResult {
        ConsensusResult {
            text: text.to_string(),
            presented_text: text.to_string(),
            status: ConsensusStatus::Agree,
            supporting_modes: vec![Mode::VGL],
            disagreed_modes: vec![],
            agreement_score: 0.8,
            confidence: Confidence::High,
            evaluated_modes: vec![Mode::VGL],
            degraded_inputs: None,
            notes: Some("agreement across requested modes".to_string()),
        }
    }

    #[test]
    fn path_tokens_map_to_organs() {
        assert_eq!(infer_expected_organ(Some("/tmp/brain_scan.png")), Some("brain"));
        assert_eq!(infer_expected_organ(Some("/tmp/head_ct.png")), Some("brain"));
        assert_eq!(infer_expected_organ(Some("/tmp/abdomen_01.png")), Some("liver"));
        assert_eq!(infer_expected_organ(Some("/tmp/chest_xray.png")), Some("lung"));
        assert_eq!(infer_expected_organ(Some("/tmp/knee.png")), None);
        assert_eq!(infer_expected_organ(None), None);
    }

    #[test]
    fn cross_organ_mention_downgrades() {
        let mut result = consensus("hepatic lesion suspected in the liver");
        let fired = apply_organ_guard(&mut result, "brain");
        assert!(fired);
        assert_eq!(result.status, ConsensusStatus::Disagree);
        assert_eq!(result.confidence, Confidence::VeryLow);
        assert_eq!(result.presented_text, GUARD_DISCLAIMER);
        assert!(result.notes.as_deref().unwrap().contains("Guard"));
    }

    #[test]
    fn matching_organ_is_untouched() {
        let mut result = consensus("cerebral infarct pattern");
        let fired = apply_organ_guard(&mut result, "brain");
        assert!(!fired);
        assert_eq!(result.status, ConsensusStatus::Agree);
        assert_eq!(result.confidence, Confidence::High);
    }
}
