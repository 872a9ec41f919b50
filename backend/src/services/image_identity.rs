//! Image identity resolution: derives the canonical image identifier, case
//! id and storage URI while encapsulating registry lookups and slug logic.

use once_cell::sync::Lazy;
use regex::Regex;
use sha1::{Digest, Sha1};
use std::path::Path;

use crate::models::ImageRecord;
use crate::services::dummy_registry::{DummyRegistry, LookupResult};
use crate::utils::{ApiError, ApiResult};

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9]+").unwrap());
static NON_ID_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_]+").unwrap());
static IMG_UNDERSCORE_NUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^IMG_\d+$").unwrap());
static IMG_NUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^IMG\d+$").unwrap());
static MODALITY_NUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(CT|US|XR)\d+$").unwrap());

/// Where the final image id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageIdSource {
    Payload,
    DummyLookup,
    FilePath,
    Normalizer,
}

impl ImageIdSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageIdSource::Payload => "payload",
            ImageIdSource::DummyLookup => "dummy_lookup",
            ImageIdSource::FilePath => "file_path",
            ImageIdSource::Normalizer => "normalizer",
        }
    }
}

/// Resolved identity metadata for downstream graph + debug consumers.
#[derive(Debug, Clone)]
pub struct ImageIdentity {
    pub image_id: String,
    pub case_id: String,
    pub path: Option<String>,
    pub storage_uri: Option<String>,
    pub storage_uri_key: Option<String>,
    pub image_id_source: ImageIdSource,
    pub lookup_source: Option<String>,
    pub seed_hit: bool,
    pub lookup_result: Option<LookupResult>,
}

/// Subset of the request fields required for identity resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityPayload<'a> {
    pub case_id: Option<&'a str>,
    pub image_id: Option<&'a str>,
    pub file_path: Option<&'a str>,
    pub idempotency_key: Option<&'a str>,
}

/// Resolve the canonical image identity, augmenting `normalized_image` in
/// place with the final id, path and storage URI.
pub fn identify_image(
    payload: IdentityPayload<'_>,
    normalized_image: &mut ImageRecord,
    resolved_path: Option<&str>,
    image_path: Option<&str>,
    registry: &DummyRegistry,
) -> ApiResult<ImageIdentity> {
    let mut image_id = normalized_image.image_id.clone();
    let mut lookup_result: Option<LookupResult> = None;
    let mut lookup_source: Option<String> = None;
    let mut image_id_source = ImageIdSource::Normalizer;

    if let Some(candidate) = payload.image_id {
        if candidate.trim().is_empty() {
            return Err(ApiError::invalid_input("image_id must not be blank"));
        }
        let normalised = DummyRegistry::normalise_id(candidate)
            .map_err(|_| ApiError::invalid_input("image_id must not be blank"))?;
        image_id = Some(normalised);
        image_id_source = ImageIdSource::Payload;
    } else {
        let path_candidate = resolved_path
            .or(payload.file_path)
            .or(image_path)
            .or(normalized_image.path.as_deref());
        if let Some((derived, lookup)) = derive_image_id_from_path(path_candidate, registry) {
            image_id = Some(derived);
            if let Some(hit) = lookup {
                lookup_source = Some(hit.source.clone());
                lookup_result = Some(hit);
                image_id_source = ImageIdSource::DummyLookup;
            } else {
                image_id_source = ImageIdSource::FilePath;
            }
        }
    }

    let image_id = image_id
        .as_deref()
        .map(DummyRegistry::normalise_id)
        .transpose()
        .map_err(|_| ApiError::unidentifiable_image("unable to derive image identifier"))?
        .ok_or_else(|| ApiError::unidentifiable_image("unable to derive image identifier"))?;

    if lookup_result.is_none() {
        if let Some(hit) = registry.resolve_by_id(&image_id) {
            lookup_source = Some(hit.source.clone());
            lookup_result = Some(hit);
            if image_id_source != ImageIdSource::Payload {
                image_id_source = ImageIdSource::DummyLookup;
            }
        }
    }

    let final_image_path = image_path
        .or(payload.file_path)
        .or(normalized_image.path.as_deref())
        .map(str::to_string);
    let case_id = payload
        .case_id
        .map(str::to_string)
        .unwrap_or_else(|| resolve_case_id(&payload, image_path, &image_id));

    let lookup_storage_uri = lookup_result.as_ref().and_then(|hit| hit.storage_uri.clone());
    let mut storage_uri =
        resolve_seed_storage_uri(resolved_path, Some(&image_id), lookup_storage_uri.as_deref());
    if storage_uri.is_none() {
        storage_uri = normalized_image.storage_uri.clone();
    }
    if storage_uri.is_none() {
        if let Some(path) = final_image_path.as_deref() {
            storage_uri = resolve_seed_storage_uri(Some(path), Some(&image_id), None)
                .or_else(|| Some(path.to_string()));
        }
    }
    let storage_uri = storage_uri.map(|uri| uri.trim().to_string()).filter(|uri| !uri.is_empty());

    let mut storage_uri_key = storage_uri
        .as_deref()
        .and_then(|uri| Path::new(uri).file_name())
        .and_then(|name| name.to_str())
        .map(str::to_string);
    if storage_uri_key.is_none() {
        storage_uri_key = resolved_path
            .and_then(|path| Path::new(path).file_name())
            .and_then(|name| name.to_str())
            .map(str::to_string);
    }
    let storage_uri_key =
        storage_uri_key.map(|key| key.trim().to_string()).filter(|key| !key.is_empty());

    if normalized_image.modality.is_none() {
        if let Some(modality) = lookup_result.as_ref().and_then(|hit| hit.modality.clone()) {
            normalized_image.modality = Some(modality);
        }
    }

    if let Some(path) = final_image_path.clone() {
        normalized_image.path = Some(path);
    }
    normalized_image.image_id = Some(image_id.clone());
    normalized_image.storage_uri = storage_uri.clone();
    normalized_image.storage_uri_key = storage_uri_key.clone();

    Ok(ImageIdentity {
        image_id,
        case_id,
        path: final_image_path,
        storage_uri,
        storage_uri_key,
        image_id_source,
        lookup_source,
        seed_hit: lookup_result.is_some(),
        lookup_result,
    })
}

fn derive_image_id_from_path(
    path: Option<&str>,
    registry: &DummyRegistry,
) -> Option<(String, Option<LookupResult>)> {
    let path = path?;

    if let Some(lookup) = registry.resolve_by_path(path) {
        return Some((lookup.image_id.clone(), Some(lookup)));
    }

    let stem = Path::new(path).file_stem().and_then(|s| s.to_str());
    if let Some(candidate) = extract_existing_identifier(stem) {
        return Some((candidate, None));
    }

    build_slug_identifier(stem.unwrap_or(path)).map(|slug| (slug, None))
}

fn extract_existing_identifier(stem: Option<&str>) -> Option<String> {
    let stem = stem?;
    let cleaned = NON_ID_CHARS.replace_all(stem, "").to_uppercase();
    if cleaned.is_empty() || !cleaned.starts_with("IMG") {
        return None;
    }
    DummyRegistry::normalise_id(&cleaned).ok()
}

fn build_slug_identifier(value: &str) -> Option<String> {
    let slug = slugify(value).to_uppercase();
    if slug.is_empty() {
        return None;
    }
    let slug: String = slug.chars().take(24).collect();
    let digest = hex::encode(Sha1::digest(value.as_bytes()))[..6].to_uppercase();
    Some(format!("IMG_{}_{}", slug, digest))
}

/// Map registry hits and well-known id patterns onto canonical storage
/// locations; anything unrecognised keeps its literal path.
fn resolve_seed_storage_uri(
    file_path: Option<&str>,
    image_id: Option<&str>,
    preferred: Option<&str>,
) -> Option<String> {
    if let Some(candidate) = preferred.map(str::trim).filter(|uri| !uri.is_empty()) {
        return Some(candidate.to_string());
    }

    let raw = file_path?;
    if raw.starts_with("/mnt/data/medical_dummy/") || raw.starts_with("/data/dummy/") {
        return Some(raw.to_string());
    }

    let path = Path::new(raw);
    let suffix = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
        .unwrap_or_else(|| ".png".to_string());
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let normalized_id = image_id.unwrap_or("").trim().to_uppercase();
    let stem_upper = stem.to_uppercase();

    if IMG_UNDERSCORE_NUM.is_match(&normalized_id) {
        return Some(format!(
            "/mnt/data/medical_dummy/images/{}{}",
            normalized_id.to_lowercase(),
            suffix
        ));
    }
    if IMG_UNDERSCORE_NUM.is_match(&stem_upper) {
        return Some(format!(
            "/mnt/data/medical_dummy/images/{}{}",
            stem.to_lowercase(),
            suffix
        ));
    }

    if IMG_NUM.is_match(&normalized_id) {
        return Some(format!("/data/dummy/{}{}", normalized_id, suffix));
    }
    if IMG_NUM.is_match(&stem_upper) {
        return Some(format!("/data/dummy/{}{}", stem_upper, suffix));
    }

    if MODALITY_NUM.is_match(&normalized_id) {
        return Some(format!("/data/dummy/{}{}", normalized_id, suffix));
    }
    if MODALITY_NUM.is_match(&stem_upper) {
        return Some(format!("/data/dummy/{}{}", stem_upper, suffix));
    }

    if stem.to_lowercase().starts_with("img_") {
        return Some(format!(
            "/mnt/data/medical_dummy/images/{}{}",
            stem.to_lowercase(),
            suffix
        ));
    }

    Some(raw.to_string())
}

fn resolve_case_id(
    payload: &IdentityPayload<'_>,
    image_path: Option<&str>,
    image_id: &str,
) -> String {
    let stem = image_path
        .and_then(|path| Path::new(path).file_stem())
        .and_then(|s| s.to_str())
        .map(str::to_string);
    let seed = payload
        .idempotency_key
        .map(str::to_string)
        .or_else(|| Some(image_id.to_string()).filter(|id| !id.is_empty()))
        .or(stem)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..12].to_string());
    format!("CASE_{}", slugify(&seed).to_uppercase())
}

fn slugify(value: &str) -> String {
    let cleaned = NON_ALNUM.replace_all(value, "_").trim_matches('_').to_string();
    let cleaned = if cleaned.is_empty() {
        uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
    } else {
        cleaned
    };
    cleaned.chars().take(48).collect()
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
        let registry = DummyRegistry::load(dir.path()).expect("registry loads");
        (dir, registry)
    }

    #[test]
    fn payload_id_wins_and_is_normalised() {
        let (_dir, registry) = seeded_registry();
        let mut image = ImageRecord::default();
        let payload = IdentityPayload { image_id: Some("img-001"), ..Default::default() };
        let identity =
            identify_image(payload, &mut image, Some("/tmp/whatever.png"), None, &registry)
                .expect("identity resolves");
        assert_eq!(identity.image_id, "IMG_001");
        assert_eq!(identity.image_id_source, ImageIdSource::Payload);
        assert!(identity.seed_hit);
        assert_eq!(
            identity.storage_uri.as_deref(),
            Some("/mnt/data/medical_dummy/images/img_001.png")
        );
    }

    #[test]
    fn blank_payload_id_is_invalid() {
        let (_dir, registry) = seeded_registry();
        let mut image = ImageRecord::default();
        let payload = IdentityPayload { image_id: Some("   "), ..Default::default() };
        let err = identify_image(payload, &mut image, None, None, &registry).unwrap_err();
        assert!(matches!(err, ApiError::InvalidInput(_)));
    }

    #[test]
    fn registry_path_lookup_sets_dummy_source() {
        let (_dir, registry) = seeded_registry();
        let mut image = ImageRecord::default();
        let payload = IdentityPayload::default();
        let identity = identify_image(
            payload,
            &mut image,
            Some("/uploads/img_001.png"),
            Some("/uploads/img_001.png"),
            &registry,
        )
        .expect("identity resolves");
        assert_eq!(identity.image_id, "IMG_001");
        assert_eq!(identity.image_id_source, ImageIdSource::DummyLookup);
        assert_eq!(image.modality.as_deref(), Some("XR"));
    }

    #[test]
    fn stem_embedded_id_is_extracted() {
        let (_dir, registry) = seeded_registry();
        let mut image = ImageRecord::default();
        let identity = identify_image(
            IdentityPayload::default(),
            &mut image,
            Some("/tmp/IMG123.png"),
            None,
            &registry,
        )
        .expect("identity resolves");
        assert_eq!(identity.image_id, "IMG123");
        assert_eq!(identity.image_id_source, ImageIdSource::FilePath);
        assert_eq!(identity.storage_uri.as_deref(), Some("/data/dummy/IMG123.png"));
    }

    #[test]
    fn arbitrary_path_gets_slug_identifier() {
        let (_dir, registry) = seeded_registry();
        let mut image = ImageRecord::default();
        let identity = identify_image(
            IdentityPayload::default(),
            &mut image,
            Some("/tmp/chest xray final.png"),
            None,
            &registry,
        )
        .expect("identity resolves");
        assert!(identity.image_id.starts_with("IMG_CHEST_XRAY_FINAL_"));
        assert_eq!(identity.image_id_source, ImageIdSource::FilePath);
    }

    #[test]
    fn no_sources_is_unidentifiable() {
        let (_dir, registry) = seeded_registry();
        let mut image = ImageRecord::default();
        let err = identify_image(IdentityPayload::default(), &mut image, None, None, &registry)
            .unwrap_err();
        assert!(matches!(err, ApiError::UnidentifiableImage(_)));
    }

    #[test]
    fn case_id_prefers_idempotency_key() {
        let (_dir, registry) = seeded_registry();
        let mut image = ImageRecord::default();
        let payload = IdentityPayload {
            image_id: Some("IMG_001"),
            idempotency_key: Some("retry-42"),
            ..Default::default()
        };
        let identity =
            identify_image(payload, &mut image, None, None, &registry).expect("resolves");
        assert_eq!(identity.case_id, "CASE_RETRY_42");
    }

    #[test]
    fn identity_is_deterministic() {
        let (_dir, registry) = seeded_registry();
        let run = || {
            let mut image = ImageRecord::default();
            identify_image(
                IdentityPayload::default(),
                &mut image,
                Some("/tmp/some scan.png"),
                None,
                &registry,
            )
            .expect("resolves")
        };
        assert_eq!(run().image_id, run().image_id);
    }
}
