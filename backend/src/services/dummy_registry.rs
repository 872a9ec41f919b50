//! Seeded registries aligning dummy-dataset inputs with graph image nodes.
//!
//! Backed by three CSVs under the dummy data directory:
//! `imaging.csv` (id, file_path, modality), `imaging_aliases.csv`
//! (alias, image_id) and `findings.csv` (image_id, finding_id, type,
//! location, size_cm, conf). Loaded once at startup and read-only after.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::models::FindingRecord;

static UNDERSCORE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"_+").unwrap());
static EMBEDDED_IMG_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"(img)[_\-]?(\d{3})").unwrap());
static WHITESPACE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("image_id cannot be blank")]
    BlankId,
    #[error("failed to read registry file {path}: {source}")]
    Io { path: String, source: csv::Error },
}

/// Row resolved from the imaging registry.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupResult {
    pub image_id: String,
    pub storage_uri: Option<String>,
    pub modality: Option<String>,
    pub source: String,
}

#[derive(Debug, Clone, Default)]
struct ImagingRow {
    storage_uri: Option<String>,
    modality: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImagingCsvRow {
    id: String,
    #[serde(default)]
    file_path: Option<String>,
    #[serde(default)]
    modality: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AliasCsvRow {
    alias: String,
    image_id: String,
}

#[derive(Debug, Deserialize)]
struct FindingCsvRow {
    image_id: String,
    finding_id: String,
    r#type: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    size_cm: Option<f64>,
    #[serde(default)]
    conf: Option<f64>,
}

/// Facade over the seeded image/finding tables. Immutable after `load`.
#[derive(Debug, Default)]
pub struct DummyRegistry {
    imaging: HashMap<String, ImagingRow>,
    aliases: HashMap<String, String>,
    findings: HashMap<String, Vec<FindingRecord>>,
}

impl DummyRegistry {
    /// Normalise image identifiers: uppercase, `-` to `_`, collapse
    /// repeated underscores, strip whitespace.
    pub fn normalise_id(raw: &str) -> Result<String, RegistryError> {
        let cleaned = raw.trim();
        if cleaned.is_empty() {
            return Err(RegistryError::BlankId);
        }
        let cleaned = cleaned.replace('-', "_").replace(' ', "").to_uppercase();
        Ok(UNDERSCORE_RUNS.replace_all(&cleaned, "_").to_string())
    }

    /// Load the registry tables from `dir`. Missing files leave the
    /// corresponding table empty (logged, not fatal).
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let dir = dir.as_ref();
        let mut registry = Self::default();

        registry.load_imaging(&dir.join("imaging.csv"))?;
        registry.load_aliases(&dir.join("imaging_aliases.csv"))?;
        registry.load_findings(&dir.join("findings.csv"))?;

        tracing::info!(
            "dummy registry loaded: {} images, {} aliases, {} finding sets",
            registry.imaging.len(),
            registry.aliases.len(),
            registry.findings.len()
        );
        Ok(registry)
    }

    fn load_imaging(&mut self, path: &PathBuf) -> Result<(), RegistryError> {
        if !path.exists() {
            tracing::warn!("dummy registry imaging file missing: {}", path.display());
            return Ok(());
        }
        let mut reader = csv::Reader::from_path(path)
            .map_err(|source| RegistryError::Io { path: path.display().to_string(), source })?;
        for row in reader.deserialize::<ImagingCsvRow>() {
            let row =
                row.map_err(|source| RegistryError::Io { path: path.display().to_string(), source })?;
            let Ok(canonical_id) = Self::normalise_id(&row.id) else { continue };
            // The file name of the storage URI doubles as an implicit alias.
            if let Some(uri) = row.file_path.as_deref() {
                if let Some(name) = Path::new(uri).file_name().and_then(|n| n.to_str()) {
                    self.aliases
                        .entry(canonical_filename(name))
                        .or_insert_with(|| canonical_id.clone());
                }
            }
            self.imaging.insert(
                canonical_id,
                ImagingRow {
                    storage_uri: row.file_path.filter(|v| !v.is_empty()),
                    modality: row.modality.filter(|v| !v.is_empty()),
                },
            );
        }
        Ok(())
    }

    fn load_aliases(&mut self, path: &PathBuf) -> Result<(), RegistryError> {
        if !path.exists() {
            return Ok(());
        }
        let mut reader = csv::Reader::from_path(path)
            .map_err(|source| RegistryError::Io { path: path.display().to_string(), source })?;
        for row in reader.deserialize::<AliasCsvRow>() {
            let row =
                row.map_err(|source| RegistryError::Io { path: path.display().to_string(), source })?;
            if row.alias.is_empty() || row.image_id.is_empty() {
                continue;
            }
            if let Ok(canonical_id) = Self::normalise_id(&row.image_id) {
                self.aliases.insert(canonical_filename(&row.alias), canonical_id);
            }
        }
        Ok(())
    }

    fn load_findings(&mut self, path: &PathBuf) -> Result<(), RegistryError> {
        if !path.exists() {
            tracing::warn!("dummy registry findings file missing: {}", path.display());
            return Ok(());
        }
        let mut reader = csv::Reader::from_path(path)
            .map_err(|source| RegistryError::Io { path: path.display().to_string(), source })?;
        for row in reader.deserialize::<FindingCsvRow>() {
            let row =
                row.map_err(|source| RegistryError::Io { path: path.display().to_string(), source })?;
            let Ok(canonical_id) = Self::normalise_id(&row.image_id) else { continue };
            self.findings.entry(canonical_id).or_default().push(FindingRecord {
                id: row.finding_id,
                r#type: Some(row.r#type),
                location: row.location.filter(|v| !v.is_empty()),
                size_cm: row.size_cm,
                conf: row.conf,
                source: Some("mock_seed".to_string()),
            });
        }
        Ok(())
    }

    /// Resolve a registry row by canonical image id.
    pub fn resolve_by_id(&self, raw_id: &str) -> Option<LookupResult> {
        let canonical_id = Self::normalise_id(raw_id).ok()?;
        let record = self.imaging.get(&canonical_id)?;
        Some(LookupResult {
            image_id: canonical_id,
            storage_uri: record.storage_uri.clone(),
            modality: record.modality.clone(),
            source: "id".to_string(),
        })
    }

    /// Resolve a registry row by file path: alias match first, then an
    /// embedded `imgNNN` identifier.
    pub fn resolve_by_path(&self, path: &str) -> Option<LookupResult> {
        let name = Path::new(path).file_name().and_then(|n| n.to_str())?;
        let canonical_name = canonical_filename(name);

        let (candidate_id, source) = match self.aliases.get(&canonical_name) {
            Some(id) => (id.clone(), "alias"),
            None => {
                let captures = EMBEDDED_IMG_ID.captures(&canonical_name)?;
                (format!("{}_{}", &captures[1].to_uppercase(), &captures[2]), "filename")
            },
        };

        let canonical_id = Self::normalise_id(&candidate_id).ok()?;
        let record = self.imaging.get(&canonical_id)?;
        Some(LookupResult {
            image_id: canonical_id,
            storage_uri: record.storage_uri.clone(),
            modality: record.modality.clone(),
            source: source.to_string(),
        })
    }

    /// Seeded findings for an image id, if any.
    pub fn resolve_findings(&self, raw_id: &str) -> Vec<FindingRecord> {
        let Ok(canonical_id) = Self::normalise_id(raw_id) else {
            return Vec::new();
        };
        self.findings.get(&canonical_id).cloned().unwrap_or_default()
    }
}

/// Normalise file names for case-insensitive lookup.
fn canonical_filename(name: &str) -> String {
    let canonical = name.trim().to_lowercase();
    let canonical = WHITESPACE_RUNS.replace_all(&canonical, "-");
    canonical.replace(['/', '\\'], "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn seeded_registry() -> (tempfile::TempDir, DummyRegistry) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut imaging = std::fs::File::create(dir.path().join("imaging.csv")).unwrap();
        writeln!(imaging, "id,file_path,modality").unwrap();
        writeln!(imaging, "IMG_001,/mnt/data/medical_dummy/images/img_001.png,XR").unwrap();
        writeln!(imaging, "IMG_002,/mnt/data/medical_dummy/images/img_002.png,CT").unwrap();

        let mut aliases = std::fs::File::create(dir.path().join("imaging_aliases.csv")).unwrap();
        writeln!(aliases, "alias,image_id").unwrap();
        writeln!(aliases, "chest sample.png,IMG_001").unwrap();

        let mut findings = std::fs::File::create(dir.path().join("findings.csv")).unwrap();
        writeln!(findings, "image_id,finding_id,type,location,size_cm,conf").unwrap();
        writeln!(findings, "IMG_001,f_seed01,Nodule,Right middle lobe,1.2,0.85").unwrap();

        let registry = DummyRegistry::load(dir.path()).expect("registry loads");
        (dir, registry)
    }

    #[test]
    fn normalise_id_canonicalises() {
        assert_eq!(DummyRegistry::normalise_id(" img-001 ").unwrap(), "IMG_001");
        assert_eq!(DummyRegistry::normalise_id("IMG__001").unwrap(), "IMG_001");
        assert!(DummyRegistry::normalise_id("   ").is_err());
    }

    #[test]
    fn resolve_by_id_returns_row() {
        let (_dir, registry) = seeded_registry();
        let hit = registry.resolve_by_id("img-001").expect("seeded id");
        assert_eq!(hit.image_id, "IMG_001");
        assert_eq!(hit.modality.as_deref(), Some("XR"));
        assert_eq!(hit.source, "id");
    }

    #[test]
    fn resolve_by_path_prefers_alias() {
        let (_dir, registry) = seeded_registry();
        let hit = registry.resolve_by_path("/tmp/Chest Sample.png").expect("alias hit");
        assert_eq!(hit.image_id, "IMG_001");
        assert_eq!(hit.source, "alias");
    }

    #[test]
    fn resolve_by_path_falls_back_to_embedded_id() {
        let (_dir, registry) = seeded_registry();
        let hit = registry.resolve_by_path("/tmp/scan-img002-final.png").expect("filename hit");
        assert_eq!(hit.image_id, "IMG_002");
        assert_eq!(hit.source, "filename");
    }

    #[test]
    fn storage_uri_filename_acts_as_alias() {
        let (_dir, registry) = seeded_registry();
        let hit = registry.resolve_by_path("/somewhere/else/img_001.png").expect("uri alias");
        assert_eq!(hit.image_id, "IMG_001");
    }

    #[test]
    fn seeded_findings_carry_mock_seed_source() {
        let (_dir, registry) = seeded_registry();
        let findings = registry.resolve_findings("IMG_001");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].source.as_deref(), Some("mock_seed"));
        assert_eq!(findings[0].id, "f_seed01");
        assert!(registry.resolve_findings("IMG_999").is_empty());
    }

    #[test]
    fn missing_files_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DummyRegistry::load(dir.path()).expect("empty registry");
        assert!(registry.resolve_by_id("IMG_001").is_none());
    }
}
