//! Mutation guard for the fallback metadata propagated across stages.
//!
//! `FallbackMeta` itself lives in the models; this guard enforces the
//! monotonicity invariant: once `used` is true it never flips back, and
//! every downstream copy must match the snapshot taken before upsert.

use thiserror::Error;

use crate::models::FallbackMeta;

#[derive(Debug, Error)]
pub enum FallbackMetaError {
    #[error("fallback meta mismatch at stage={stage}: {fields:?}")]
    Mismatch { stage: String, fields: Vec<&'static str> },
    #[error("fallback meta regressed at stage={stage}: used flipped true -> false")]
    Regressed { stage: String },
}

/// Tracks fallback metadata across stages and ensures it isn't reassigned.
#[derive(Debug)]
pub struct FallbackMetaGuard {
    meta: FallbackMeta,
    history: Vec<(String, FallbackMeta)>,
}

impl FallbackMetaGuard {
    pub fn new(meta: FallbackMeta, stage: &str) -> Self {
        let history = vec![(stage.to_string(), meta.clone())];
        Self { meta, history }
    }

    pub fn meta(&self) -> &FallbackMeta {
        &self.meta
    }

    /// Replace the tracked metadata. Rejects a true -> false transition of
    /// `used`.
    pub fn update(&mut self, meta: FallbackMeta, stage: &str) -> Result<(), FallbackMetaError> {
        if self.meta.used && !meta.used {
            return Err(FallbackMetaError::Regressed { stage: stage.to_string() });
        }
        self.meta = meta;
        self.history.push((stage.to_string(), self.meta.clone()));
        Ok(())
    }

    /// Record and return a copy for embedding into a downstream view.
    pub fn snapshot(&mut self, stage: &str) -> FallbackMeta {
        self.history.push((stage.to_string(), self.meta.clone()));
        self.meta.clone()
    }

    /// Verify a downstream copy still matches the tracked metadata.
    pub fn ensure(&self, payload: &FallbackMeta, stage: &str) -> Result<(), FallbackMetaError> {
        let mut fields: Vec<&'static str> = Vec::new();
        if self.meta.used != payload.used {
            fields.push("used");
        }
        if self.meta.forced != payload.forced {
            fields.push("forced");
        }
        if self.meta.strategy != payload.strategy {
            fields.push("strategy");
        }
        if self.meta.registry_hit != payload.registry_hit {
            fields.push("registry_hit");
        }
        if self.meta.seeded_ids != payload.seeded_ids {
            fields.push("seeded_ids");
        }
        if fields.is_empty() {
            Ok(())
        } else {
            Err(FallbackMetaError::Mismatch { stage: stage.to_string(), fields })
        }
    }

    pub fn history(&self) -> &[(String, FallbackMeta)] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(used: bool) -> FallbackMeta {
        FallbackMeta {
            used,
            forced: false,
            strategy: used.then(|| "mock_seed".to_string()),
            registry_hit: used,
            seeded_ids: vec![],
        }
    }

    #[test]
    fn used_is_monotonic() {
        let mut guard = FallbackMetaGuard::new(meta(false), "init");
        guard.update(meta(true), "normalize").expect("false -> true is allowed");
        let err = guard.update(meta(false), "context").unwrap_err();
        assert!(matches!(err, FallbackMetaError::Regressed { .. }));
    }

    #[test]
    fn ensure_flags_divergent_copies() {
        let guard = FallbackMetaGuard::new(meta(true), "init");
        let mut copy = meta(true);
        copy.strategy = Some("caption_keywords".to_string());
        let err = guard.ensure(&copy, "results").unwrap_err();
        match err {
            FallbackMetaError::Mismatch { fields, .. } => assert_eq!(fields, vec!["strategy"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn snapshot_records_history() {
        let mut guard = FallbackMetaGuard::new(meta(false), "init");
        let _ = guard.snapshot("pre_upsert");
        let _ = guard.snapshot("results");
        assert_eq!(guard.history().len(), 3);
    }
}
