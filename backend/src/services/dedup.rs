//! De-duplication helpers for findings and graph paths.

use std::collections::HashSet;

use crate::models::{EvidencePath, FindingRecord};

/// Remove duplicate findings based on semantic attributes.
///
/// The signature is `(type, location, size_cm rounded to 0.1)`; the first
/// occurrence wins so registry-seeded entries keep their ids.
pub fn dedup_findings(findings: Vec<FindingRecord>) -> Vec<FindingRecord> {
    let mut seen: HashSet<(String, String, i64)> = HashSet::new();
    let mut deduped = Vec::with_capacity(findings.len());
    for finding in findings {
        let finding_type =
            finding.r#type.as_deref().unwrap_or("").trim().to_lowercase();
        let location = finding.location.as_deref().unwrap_or("").trim().to_lowercase();
        let size = (finding.size_cm.unwrap_or(0.0) * 10.0).round() as i64;
        if seen.insert((finding_type, location, size)) {
            deduped.push(finding);
        }
    }
    deduped
}

/// Remove duplicate context paths using label + triple signature.
pub fn dedup_paths(paths: Vec<EvidencePath>) -> Vec<EvidencePath> {
    let mut seen: HashSet<(String, Vec<String>)> = HashSet::new();
    let mut deduped = Vec::with_capacity(paths.len());
    for path in paths {
        if path.triples.is_empty() {
            continue;
        }
        if seen.insert((path.label.clone(), path.triples.clone())) {
            deduped.push(path);
        }
    }
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Slot;

    fn finding(id: &str, kind: &str, location: &str, size: Option<f64>) -> FindingRecord {
        FindingRecord {
            id: id.to_string(),
            r#type: Some(kind.to_string()),
            location: Some(location.to_string()),
            size_cm: size,
            conf: Some(0.7),
            source: None,
        }
    }

    #[test]
    fn findings_dedupe_by_semantic_signature() {
        let deduped = dedup_findings(vec![
            finding("f_1", "Nodule", "Right middle lobe", Some(1.2)),
            finding("f_2", "nodule", "right middle lobe", Some(1.2)),
            finding("f_3", "Nodule", "Right middle lobe", Some(2.0)),
        ]);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].id, "f_1");
    }

    #[test]
    fn paths_dedupe_by_label_and_triples() {
        let path = EvidencePath {
            label: "Nodule".to_string(),
            triples: vec!["Image[IMG_001] -HAS_FINDING-> Finding[f_1]".to_string()],
            score: Some(0.8),
            slot: Some(Slot::Findings),
        };
        let deduped = dedup_paths(vec![path.clone(), path.clone()]);
        assert_eq!(deduped.len(), 1);
    }

    #[test]
    fn paths_without_triples_are_dropped() {
        let empty = EvidencePath {
            label: "empty".to_string(),
            triples: vec![],
            score: None,
            slot: None,
        };
        assert!(dedup_paths(vec![empty]).is_empty());
    }
}
