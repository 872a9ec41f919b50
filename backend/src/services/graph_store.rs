//! Transport seam for the property-graph store.
//!
//! `GraphStore` keeps the driver contract-only: the repository crafts
//! Cypher, the store moves rows. The production implementation speaks the
//! HTTP transaction API; tests swap in an in-memory mock.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use crate::config::GraphConfig;
use crate::utils::{ApiError, ApiResult};

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn run_read(&self, query: &str, parameters: Value) -> ApiResult<Vec<Value>>;
    async fn run_write(&self, query: &str, parameters: Value) -> ApiResult<Vec<Value>>;

    /// `RETURN 1 AS up` readiness probe.
    async fn health(&self) -> bool {
        match self.run_read("RETURN 1 AS up", Value::Null).await {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.get("up"))
                .and_then(Value::as_i64)
                .is_some_and(|up| up == 1),
            Err(_) => false,
        }
    }
}

/// Graph store client over the HTTP transaction endpoint.
pub struct HttpGraphStore {
    http_client: Client,
    base_url: String,
    database: String,
    user: String,
    password: String,
}

impl HttpGraphStore {
    pub fn new(config: &GraphConfig) -> Self {
        let http_client =
            Client::builder().timeout(Duration::from_secs(30)).build().unwrap_or_default();
        Self {
            http_client,
            base_url: config.uri.clone(),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        }
    }

    async fn run(&self, query: &str, parameters: Value) -> ApiResult<Vec<Value>> {
        let url = format!("{}/db/{}/tx/commit", self.base_url, self.database);
        let parameters = match parameters {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other,
        };
        let body = serde_json::json!({
            "statements": [{ "statement": query, "parameters": parameters }],
        });

        let response = self
            .http_client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Graph request failed: {}", e);
                ApiError::Other(anyhow::anyhow!("Graph request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!("Graph request failed with status {}: {}", status, error_text);
            return Err(ApiError::Other(anyhow::anyhow!("Graph returned status {}", status)));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ApiError::Other(anyhow::anyhow!("Failed to parse graph response: {}", e)))?;

        if let Some(errors) = payload.get("errors").and_then(Value::as_array) {
            if let Some(first) = errors.first() {
                let message = first
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown graph error");
                return Err(ApiError::Other(anyhow::anyhow!("Graph error: {}", message)));
            }
        }

        // Zip each row with the statement's column names into objects.
        let mut rows = Vec::new();
        if let Some(result) = payload.get("results").and_then(Value::as_array).and_then(|r| r.first())
        {
            let columns: Vec<&str> = result
                .get("columns")
                .and_then(Value::as_array)
                .map(|cols| cols.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if let Some(data) = result.get("data").and_then(Value::as_array) {
                for entry in data {
                    if let Some(row) = entry.get("row").and_then(Value::as_array) {
                        let mut object = serde_json::Map::new();
                        for (column, value) in columns.iter().zip(row.iter()) {
                            object.insert(column.to_string(), value.clone());
                        }
                        rows.push(Value::Object(object));
                    }
                }
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl GraphStore for HttpGraphStore {
    async fn run_read(&self, query: &str, parameters: Value) -> ApiResult<Vec<Value>> {
        self.run(query, parameters).await
    }

    async fn run_write(&self, query: &str, parameters: Value) -> ApiResult<Vec<Value>> {
        self.run(query, parameters).await
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory store for tests: canned rows keyed by a query marker
    /// substring, plus a transcript of every executed statement.
    #[derive(Default)]
    pub struct MockGraphStore {
        responses: Mutex<HashMap<&'static str, Vec<Vec<Value>>>>,
        pub statements: Mutex<Vec<(String, Value)>>,
        pub healthy: bool,
    }

    impl MockGraphStore {
        pub fn new() -> Self {
            Self { healthy: true, ..Default::default() }
        }

        /// Register rows returned for any query containing `marker`. Multiple
        /// registrations for the same marker are consumed FIFO, with the
        /// final one repeating.
        pub fn respond(&self, marker: &'static str, rows: Vec<Value>) {
            self.responses.lock().unwrap().entry(marker).or_default().push(rows);
        }

        pub fn executed(&self) -> Vec<String> {
            self.statements.lock().unwrap().iter().map(|(q, _)| q.clone()).collect()
        }

        fn rows_for(&self, query: &str) -> Vec<Value> {
            let mut responses = self.responses.lock().unwrap();
            for (marker, queue) in responses.iter_mut() {
                if query.contains(*marker) {
                    if queue.len() > 1 {
                        return queue.remove(0);
                    }
                    return queue.first().cloned().unwrap_or_default();
                }
            }
            Vec::new()
        }
    }

    #[async_trait]
    impl GraphStore for MockGraphStore {
        async fn run_read(&self, query: &str, parameters: Value) -> ApiResult<Vec<Value>> {
            self.statements.lock().unwrap().push((query.to_string(), parameters));
            Ok(self.rows_for(query))
        }

        async fn run_write(&self, query: &str, parameters: Value) -> ApiResult<Vec<Value>> {
            self.statements.lock().unwrap().push((query.to_string(), parameters));
            Ok(self.rows_for(query))
        }

        async fn health(&self) -> bool {
            self.healthy
        }
    }
}
