//! HTTP client for the remote vision-language model endpoint.

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::config::VlmConfig;
use crate::utils::{ApiError, ApiResult};

/// Generic interface over the vision-language backend; the HTTP runner is
/// the production implementation, tests substitute canned captioners.
#[async_trait]
pub trait VlmService: Send + Sync {
    async fn generate(
        &self,
        image_bytes: &[u8],
        prompt: &str,
        task: VlmTask,
        temperature: f64,
    ) -> ApiResult<VlmGeneration>;

    async fn health(&self) -> bool;

    fn model(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlmTask {
    Caption,
    Vqa,
}

impl VlmTask {
    fn as_str(self) -> &'static str {
        match self {
            VlmTask::Caption => "caption",
            VlmTask::Vqa => "vqa",
        }
    }
}

#[derive(Debug, Clone)]
pub struct VlmGeneration {
    pub output: String,
    pub model: String,
    pub latency_ms: u64,
    pub raw: Value,
}

pub struct VlmRunner {
    http_client: Client,
    base_url: String,
    pub model: String,
}

impl VlmRunner {
    pub fn new(config: &VlmConfig) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { http_client, base_url: config.host.clone(), model: config.model.clone() }
    }

    /// Submit an image + prompt to the vision endpoint.
    async fn generate_inner(
        &self,
        image_bytes: &[u8],
        prompt: &str,
        task: VlmTask,
        temperature: f64,
    ) -> ApiResult<VlmGeneration> {
        let url = format!("{}/api/v1/vision", self.base_url);
        let start = Instant::now();

        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "task": task.as_str(),
            "temperature": temperature,
            "images": [base64::engine::general_purpose::STANDARD.encode(image_bytes)],
        });

        let response = self.http_client.post(&url).json(&body).send().await.map_err(|e| {
            tracing::error!("VLM request failed: {}", e);
            ApiError::Other(anyhow::anyhow!("VLM request failed: {}", e))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!("VLM request failed with status {}: {}", status, error_text);
            return Err(ApiError::Other(anyhow::anyhow!("VLM returned status {}", status)));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| ApiError::Other(anyhow::anyhow!("Failed to parse VLM response: {}", e)))?;
        let latency_ms = start.elapsed().as_millis() as u64;

        let output = data.get("result").and_then(Value::as_str).unwrap_or_default().to_string();
        let model = data
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(self.model.as_str())
            .to_string();

        Ok(VlmGeneration { output, model, latency_ms, raw: data })
    }

}

#[async_trait]
impl VlmService for VlmRunner {
    async fn generate(
        &self,
        image_bytes: &[u8],
        prompt: &str,
        task: VlmTask,
        temperature: f64,
    ) -> ApiResult<VlmGeneration> {
        self.generate_inner(image_bytes, prompt, task, temperature).await
    }

    /// Lightweight readiness probe for the underlying endpoint.
    async fn health(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.http_client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn model(&self) -> &str {
        &self.model
    }
}
