//! Validation enforcing the finding schema and the canonical vocabulary
//! before anything reaches the graph.

use thiserror::Error;

use crate::models::FindingRecord;
use crate::services::ontology_map;

#[derive(Debug, Error)]
#[error("finding[{index}].{field}: {message}")]
pub struct FindingValidationError {
    pub index: usize,
    pub field: &'static str,
    pub message: String,
}

impl FindingValidationError {
    fn new(index: usize, field: &'static str, message: impl Into<String>) -> Self {
        Self { index, field, message: message.into() }
    }
}

/// Validate and canonicalise a sequence of findings.
///
/// Each finding must carry a non-blank id and a type from the canonical
/// vocabulary; locations are optional but must canonicalise when present.
/// Confidence is clamped to [0, 1] and sizes rounded to 0.1 cm.
pub fn validate_findings(
    findings: &[FindingRecord],
) -> Result<Vec<FindingRecord>, FindingValidationError> {
    let mut validated = Vec::with_capacity(findings.len());
    for (index, finding) in findings.iter().enumerate() {
        let mut clean = finding.clone();

        if clean.id.trim().is_empty() {
            return Err(FindingValidationError::new(index, "id", "cannot be blank"));
        }
        clean.id = clean.id.trim().to_string();

        let (canonical_type, _) = ontology_map::canonicalise_label(clean.r#type.as_deref())
            .ok_or_else(|| {
                FindingValidationError::new(
                    index,
                    "type",
                    format!(
                        "'{}' is not a canonical finding label",
                        clean.r#type.as_deref().unwrap_or("")
                    ),
                )
            })?;
        clean.r#type = Some(canonical_type);

        if let Some(raw_location) = clean.location.as_deref() {
            if !raw_location.trim().is_empty() {
                let (canonical_location, _) =
                    ontology_map::canonicalise_location(Some(raw_location)).ok_or_else(|| {
                        FindingValidationError::new(
                            index,
                            "location",
                            format!("'{}' is not a canonical anatomy location", raw_location),
                        )
                    })?;
                clean.location = Some(canonical_location);
            } else {
                clean.location = None;
            }
        }

        clean.conf = clean.conf.map(|conf| conf.clamp(0.0, 1.0));
        clean.size_cm = clean.size_cm.map(|size| (size * 10.0).round() / 10.0);

        validated.push(clean);
    }
    Ok(validated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(kind: &str, location: Option<&str>) -> FindingRecord {
        FindingRecord {
            id: "f_abc".to_string(),
            r#type: Some(kind.to_string()),
            location: location.map(|l| l.to_string()),
            size_cm: Some(1.24),
            conf: Some(1.4),
            source: None,
        }
    }

    #[test]
    fn canonicalises_and_clamps() {
        let validated =
            validate_findings(&[finding("결절", Some("rml"))]).expect("valid finding");
        assert_eq!(validated[0].r#type.as_deref(), Some("Nodule"));
        assert_eq!(validated[0].location.as_deref(), Some("Right middle lobe"));
        assert_eq!(validated[0].conf, Some(1.0));
        assert_eq!(validated[0].size_cm, Some(1.2));
    }

    #[test]
    fn rejects_unknown_type_with_index() {
        let err = validate_findings(&[
            finding("Nodule", None),
            finding("levitation", None),
        ])
        .unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.field, "type");
    }

    #[test]
    fn rejects_unknown_location() {
        let err = validate_findings(&[finding("Nodule", Some("fourth dimension"))]).unwrap_err();
        assert_eq!(err.field, "location");
    }

    #[test]
    fn blank_id_is_rejected() {
        let mut bad = finding("Nodule", None);
        bad.id = "  ".to_string();
        let err = validate_findings(&[bad]).unwrap_err();
        assert_eq!(err.field, "id");
    }

    #[test]
    fn blank_location_is_dropped_not_rejected() {
        let validated =
            validate_findings(&[finding("Nodule", Some("  "))]).expect("blank location ok");
        assert_eq!(validated[0].location, None);
    }
}
