//! Structured diagnostics container for `/pipeline/analyze`.
//!
//! A mutable accumulator that no-ops entirely when debug is disabled, so
//! the orchestrator can record unconditionally.

use serde_json::{Map, Value, json};

#[derive(Debug)]
pub struct DebugPayloadBuilder {
    enabled: bool,
    payload: Map<String, Value>,
}

impl DebugPayloadBuilder {
    pub fn new(enabled: bool) -> Self {
        let mut payload = Map::new();
        if enabled {
            payload.insert("stage".to_string(), json!("init"));
        }
        Self { enabled, payload }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_stage(&mut self, stage: &str) {
        if !self.enabled {
            return;
        }
        self.payload.insert("stage".to_string(), json!(stage));
    }

    /// Insert a key. Serialization failures are swallowed; diagnostics must
    /// never fail the request.
    pub fn record<T: serde::Serialize>(&mut self, key: &str, value: T) {
        if !self.enabled {
            return;
        }
        if let Ok(value) = serde_json::to_value(value) {
            self.payload.insert(key.to_string(), value);
        }
    }

    /// Insert a key only when not already present.
    pub fn record_default<T: serde::Serialize>(&mut self, key: &str, value: T) {
        if !self.enabled || self.payload.contains_key(key) {
            return;
        }
        self.record(key, value);
    }

    pub fn payload(&self) -> Value {
        if self.enabled {
            Value::Object(self.payload.clone())
        } else {
            Value::Object(Map::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_builder_is_a_noop() {
        let mut builder = DebugPayloadBuilder::new(false);
        builder.set_stage("vlm");
        builder.record("norm_image_id", "IMG_001");
        assert_eq!(builder.payload(), json!({}));
    }

    #[test]
    fn enabled_builder_accumulates_keys() {
        let mut builder = DebugPayloadBuilder::new(true);
        builder.set_stage("pre_upsert");
        builder.record("norm_image_id", "IMG_001");
        builder.record("pre_upsert_findings_len", 2);
        let payload = builder.payload();
        assert_eq!(payload["stage"], "pre_upsert");
        assert_eq!(payload["norm_image_id"], "IMG_001");
        assert_eq!(payload["pre_upsert_findings_len"], 2);
    }

    #[test]
    fn record_default_keeps_existing_values() {
        let mut builder = DebugPayloadBuilder::new(true);
        builder.record("graph_paths_strength", 0.6);
        builder.record_default("graph_paths_strength", 0.1);
        assert_eq!(builder.payload()["graph_paths_strength"], 0.6);
    }
}
