//! Canonical label/location vocabulary shared across the pipeline.
//!
//! Finding types and anatomy locations must alias to a canonical entry
//! before they reach the graph; unknown terms are rejected upstream.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Canonical finding labels with their accepted aliases.
static LABEL_CANONICALS: &[(&str, &[&str])] = &[
    ("Mass", &["lesion", "덩어리", "mass lesion"]),
    ("Nodule", &["결절", "nodule", "small mass"]),
    ("Opacity", &["infiltrate", "음영", "opacity"]),
    ("Hypodensity", &["low attenuation area", "저음영", "reduced density"]),
    (
        "Subarachnoid Hemorrhage",
        &["sah", "subarachnoid bleeding", "수막하출혈", "subarachnoid haemorrhage"],
    ),
    ("Ischemic", &["ischemia", "ischemic change"]),
];

static LOCATION_CANONICALS: &[(&str, &[&str])] = &[
    ("Right lobe of the liver", &["right hepatic lobe", "rhl", "right lobe liver"]),
    ("Left parietal lobe", &["left parietal region", "left parietal", "좌측두정엽"]),
    ("Right upper lobe", &["rul", "right upper lung lobe"]),
    ("Right middle lobe", &["rml", "right middle lung lobe"]),
    ("Right lower lobe", &["rll", "right lower lung lobe"]),
    ("Left upper lobe", &["lul", "left upper lung lobe"]),
    ("Left lower lobe", &["lll", "left lower lung lobe"]),
    ("Lung", &["pulmonary", "lungs"]),
    ("Liver", &["hepatic parenchyma", "liver"]),
    ("Brain", &["cerebral", "intracranial"]),
];

/// Priority used to break ties when several labels match equally well.
pub const TIEBREAKER_PRIORITY: &[&str] =
    &["Subarachnoid Hemorrhage", "Hypodensity", "Mass", "Nodule", "Opacity", "Ischemic"];

static LABEL_ALIAS_MAP: Lazy<HashMap<String, (String, String)>> =
    Lazy::new(|| build_alias_map(LABEL_CANONICALS));

static LOCATION_ALIAS_MAP: Lazy<HashMap<String, (String, String)>> =
    Lazy::new(|| build_alias_map(LOCATION_CANONICALS));

static TIEBREAKER_MAP: Lazy<HashMap<&'static str, usize>> = Lazy::new(|| {
    TIEBREAKER_PRIORITY.iter().enumerate().map(|(idx, label)| (*label, idx)).collect()
});

/// Normalise strings for case-insensitive, punctuation-free comparison.
fn simplify(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || ('가'..='힣').contains(ch))
        .collect()
}

fn build_alias_map(table: &[(&str, &[&str])]) -> HashMap<String, (String, String)> {
    let mut mapping = HashMap::new();
    for (canonical, aliases) in table {
        mapping
            .entry(simplify(canonical))
            .or_insert_with(|| (canonical.to_string(), "canonical".to_string()));
        for alias in *aliases {
            let alias_clean = alias.trim();
            if alias_clean.is_empty() {
                continue;
            }
            mapping.insert(
                simplify(alias_clean),
                (canonical.to_string(), format!("alias:{}", alias_clean)),
            );
        }
    }
    mapping
}

fn canonicalise(
    raw: Option<&str>,
    table: &HashMap<String, (String, String)>,
) -> Option<(String, String)> {
    let candidate = raw?.trim();
    if candidate.is_empty() {
        return None;
    }
    table.get(&simplify(candidate)).cloned()
}

/// Map a raw finding type onto its canonical label, or None when the term
/// is outside the vocabulary.
pub fn canonicalise_label(raw: Option<&str>) -> Option<(String, String)> {
    canonicalise(raw, &LABEL_ALIAS_MAP)
}

/// Map a raw anatomy location onto its canonical entry.
pub fn canonicalise_location(raw: Option<&str>) -> Option<(String, String)> {
    canonicalise(raw, &LOCATION_ALIAS_MAP)
}

pub fn rank_label(label: Option<&str>) -> usize {
    match label {
        Some(value) => {
            *TIEBREAKER_MAP.get(value).unwrap_or(&(TIEBREAKER_PRIORITY.len() + 1))
        },
        None => TIEBREAKER_PRIORITY.len() + 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_maps_to_canonical_label() {
        let (canonical, via) = canonicalise_label(Some("결절")).expect("known alias");
        assert_eq!(canonical, "Nodule");
        assert!(via.starts_with("alias:"));
    }

    #[test]
    fn canonical_label_passes_through() {
        let (canonical, via) = canonicalise_label(Some("Opacity")).expect("canonical");
        assert_eq!(canonical, "Opacity");
        assert_eq!(via, "canonical");
    }

    #[test]
    fn simplify_ignores_case_and_punctuation() {
        assert_eq!(
            canonicalise_location(Some("Right-Middle LOBE")).map(|(c, _)| c),
            Some("Right middle lobe".to_string())
        );
    }

    #[test]
    fn unknown_label_is_rejected() {
        assert!(canonicalise_label(Some("teleportation artefact")).is_none());
        assert!(canonicalise_label(Some("   ")).is_none());
        assert!(canonicalise_label(None).is_none());
    }

    #[test]
    fn lobe_codes_resolve() {
        for (code, expected) in [
            ("rul", "Right upper lobe"),
            ("rml", "Right middle lobe"),
            ("rll", "Right lower lobe"),
            ("lul", "Left upper lobe"),
            ("lll", "Left lower lobe"),
        ] {
            assert_eq!(
                canonicalise_location(Some(code)).map(|(c, _)| c).as_deref(),
                Some(expected)
            );
        }
    }

    #[test]
    fn tiebreaker_rank_orders_priority() {
        assert!(rank_label(Some("Subarachnoid Hemorrhage")) < rank_label(Some("Opacity")));
        assert!(rank_label(Some("Opacity")) < rank_label(Some("unranked")));
        assert_eq!(rank_label(None), TIEBREAKER_PRIORITY.len() + 1);
    }
}
