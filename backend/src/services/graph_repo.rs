//! Repository for the case/image/report/finding subgraph.
//!
//! Owns the Cypher for idempotent upserts, edge summaries, top-k evidence
//! paths and similarity sync. Findings are validated against the canonical
//! vocabulary before any write.

use serde_json::{Value, json};
use std::sync::Arc;

use crate::models::{
    ContextFacts, EvidencePath, FactFinding, FindingRecord, ImageRecord, ReportRecord,
    SimilarityEdge, Slot, SlotLimits, SummaryRow,
};
use crate::services::finding_validation::validate_findings;
use crate::services::graph_store::GraphStore;
use crate::services::similarity::SimilarityCandidate;
use crate::utils::{ApiError, ApiResult};

// Image nodes are merged on storage_uri when one is known so that repeated
// uploads of the same file converge on a single node.
const UPSERT_CASE_BY_STORAGE_URI: &str = r#"
MERGE (c:Case {id:$case_id})
MERGE (i:Image {storage_uri:$image.storage_uri})
ON CREATE SET i.image_id=$image.image_id
SET i.path=$image.path, i.modality=$image.modality
MERGE (c)-[:HAS_IMAGE]->(i)
MERGE (r:Report {id:$report.id})
SET r.text=$report.text, r.model=$report.model, r.conf=$report.conf, r.ts=$report.ts
MERGE (i)-[:DESCRIBED_BY]->(r)
FOREACH (f IN $findings |
  MERGE (fd:Finding {id:f.id})
  SET fd.type=f.type, fd.location=f.location, fd.size_cm=f.size_cm, fd.conf=f.conf
  MERGE (i)-[:HAS_FINDING]->(fd)
  FOREACH (_ IN CASE WHEN f.location IS NULL THEN [] ELSE [1] END |
    MERGE (a:Anatomy {name:f.location})
    MERGE (fd)-[:LOCATED_IN]->(a)
  )
)
FOREACH (_ IN CASE WHEN $idempotency_key IS NULL THEN [] ELSE [1] END |
  MERGE (token:Idempotency {key:$idempotency_key})
  ON CREATE SET token.created_at = datetime()
  SET token.case_id = $case_id,
      token.image_id = i.image_id,
      token.updated_at = datetime()
  MERGE (token)-[:FOR_CASE]->(c)
  MERGE (token)-[:FOR_IMAGE]->(i)
)
WITH i
OPTIONAL MATCH (i)-[:HAS_FINDING]->(fd:Finding)
RETURN i.image_id AS image_id, collect(fd.id) AS finding_ids
"#;

const UPSERT_CASE_BY_IMAGE_ID: &str = r#"
MERGE (c:Case {id:$case_id})
MERGE (i:Image {image_id:$image.image_id})
SET i.path=$image.path, i.modality=$image.modality
MERGE (c)-[:HAS_IMAGE]->(i)
MERGE (r:Report {id:$report.id})
SET r.text=$report.text, r.model=$report.model, r.conf=$report.conf, r.ts=$report.ts
MERGE (i)-[:DESCRIBED_BY]->(r)
FOREACH (f IN $findings |
  MERGE (fd:Finding {id:f.id})
  SET fd.type=f.type, fd.location=f.location, fd.size_cm=f.size_cm, fd.conf=f.conf
  MERGE (i)-[:HAS_FINDING]->(fd)
  FOREACH (_ IN CASE WHEN f.location IS NULL THEN [] ELSE [1] END |
    MERGE (a:Anatomy {name:f.location})
    MERGE (fd)-[:LOCATED_IN]->(a)
  )
)
FOREACH (_ IN CASE WHEN $idempotency_key IS NULL THEN [] ELSE [1] END |
  MERGE (token:Idempotency {key:$idempotency_key})
  ON CREATE SET token.created_at = datetime()
  SET token.case_id = $case_id,
      token.image_id = i.image_id,
      token.updated_at = datetime()
  MERGE (token)-[:FOR_CASE]->(c)
  MERGE (token)-[:FOR_IMAGE]->(i)
)
WITH i
OPTIONAL MATCH (i)-[:HAS_FINDING]->(fd:Finding)
RETURN i.image_id AS image_id, collect(fd.id) AS finding_ids
"#;

const FINDING_IDS_QUERY: &str = r#"
MATCH (i:Image {image_id:$image_id})-[:HAS_FINDING]->(f:Finding)
WHERE $expected_ids IS NULL OR f.id IN $expected_ids
RETURN f.id AS id
"#;

const EDGE_SUMMARY_QUERY: &str = r#"
MATCH (i:Image {image_id:$image_id})
WITH i
OPTIONAL MATCH (i)-[:HAS_FINDING]->(f:Finding)
WITH i,
     count(f) AS cnt_f,
     round(coalesce(avg(f.conf), 0.0), 2) AS avg_f
WITH i,
     CASE WHEN cnt_f = 0 THEN [] ELSE [{rel:'HAS_FINDING', cnt: cnt_f, avg_conf: avg_f}] END AS summary
OPTIONAL MATCH (i)-[:DESCRIBED_BY]->(r:Report)
WITH summary,
     count(r) AS cnt_r,
     round(coalesce(avg(r.conf), 0.0), 2) AS avg_r
WITH summary + CASE WHEN cnt_r = 0 THEN [] ELSE [{rel:'DESCRIBED_BY', cnt: cnt_r, avg_conf: avg_r}] END AS combined
UNWIND combined AS row
RETURN row.rel AS rel, row.cnt AS cnt, row.avg_conf AS avg_conf
"#;

const FACTS_QUERY: &str = r#"
MATCH (i:Image {image_id:$image_id})-[:HAS_FINDING]->(f:Finding)
OPTIONAL MATCH (f)-[:LOCATED_IN]->(a:Anatomy)
RETURN i.image_id AS image_id,
       collect({type:f.type, location:coalesce(a.name, f.location), size_cm:f.size_cm, conf:f.conf}) AS findings
"#;

const FINDING_PATHS_QUERY: &str = r#"
MATCH (i:Image {image_id:$image_id})-[:HAS_FINDING]->(f:Finding)
OPTIONAL MATCH (f)-[r1:LOCATED_IN]->(a:Anatomy)
OPTIONAL MATCH (i)-[r2:DESCRIBED_BY]->(rep:Report)
WITH f, a,
     coalesce(f.conf,0.5) AS f_conf,
     coalesce(r1.conf,0.5) AS loc_conf,
     coalesce(r2.conf,0.5) AS rep_conf,
     coalesce(f.ts, datetime("1970-01-01")) AS f_ts
WITH f, a, ($alpha*f_conf + $beta*loc_conf + (1.0-$alpha-$beta)*rep_conf) AS score, f_ts
ORDER BY score DESC, f_ts DESC
RETURN f.id AS finding_id, f.type AS type, a.name AS anatomy, score
LIMIT $limit
"#;

const REPORT_PATHS_QUERY: &str = r#"
MATCH (i:Image {image_id:$image_id})-[:DESCRIBED_BY]->(r:Report)
WITH r, coalesce(r.conf,0.5) AS score, coalesce(r.ts, datetime("1970-01-01")) AS r_ts
ORDER BY score DESC, r_ts DESC
RETURN r.id AS report_id, r.model AS model, score
LIMIT $limit
"#;

const SIMILARITY_PATHS_QUERY: &str = r#"
MATCH (i:Image {image_id:$image_id})-[s:SIMILAR_TO]->(o:Image)
WITH o, coalesce(s.score,0.0) AS score, s.basis AS basis
ORDER BY score DESC, o.image_id ASC
RETURN o.image_id AS other_id, basis, score
LIMIT $limit
"#;

const SIMILARITY_CANDIDATES_QUERY: &str = r#"
MATCH (o:Image)
WHERE o.image_id IS NOT NULL AND o.image_id <> $image_id
OPTIONAL MATCH (o)-[:HAS_FINDING]->(f:Finding)
OPTIONAL MATCH (f)-[:LOCATED_IN]->(a:Anatomy)
RETURN o.image_id AS image_id,
       o.modality AS modality,
       [t IN collect(DISTINCT f.type) WHERE t IS NOT NULL] AS finding_types,
       [l IN collect(DISTINCT f.location) WHERE l IS NOT NULL] AS finding_locations,
       [n IN collect(DISTINCT a.name) WHERE n IS NOT NULL] AS anatomy_codes
"#;

const SYNC_SIMILARITY_EDGES_QUERY: &str = r#"
UNWIND $edges AS edge
MATCH (i:Image {image_id:$image_id})
MATCH (o:Image {image_id:edge.image_id})
MERGE (i)-[s:SIMILAR_TO]->(o)
SET s.score = edge.score, s.basis = edge.basis
RETURN count(s) AS created
"#;

/// Write payload for one case subgraph.
#[derive(Debug, Clone)]
pub struct CaseUpsert {
    pub case_id: String,
    pub image: ImageRecord,
    pub report: ReportRecord,
    pub findings: Vec<FindingRecord>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpsertReceipt {
    pub image_id: String,
    pub finding_ids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BundlePayload {
    pub summary_rows: Vec<SummaryRow>,
    pub facts: ContextFacts,
}

pub struct GraphRepo {
    store: Arc<dyn GraphStore>,
}

impl GraphRepo {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn GraphStore> {
        Arc::clone(&self.store)
    }

    /// Idempotently merge the case subgraph. Findings are canonicalised
    /// before the write; validation failures bubble up as 422.
    pub async fn upsert_case(&self, payload: &CaseUpsert) -> ApiResult<UpsertReceipt> {
        if payload.case_id.trim().is_empty() {
            return Err(ApiError::invalid_input("case_id is required"));
        }
        let image_id = payload
            .image
            .image_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ApiError::invalid_input("image.image_id is required"))?;

        let findings = validate_findings(&payload.findings)
            .map_err(|e| ApiError::invalid_input(e.to_string()))?;

        let findings_param: Vec<Value> = findings
            .iter()
            .map(|f| {
                json!({
                    "id": f.id,
                    "type": f.r#type,
                    "location": f.location,
                    "size_cm": f.size_cm,
                    "conf": f.conf,
                })
            })
            .collect();

        let parameters = json!({
            "case_id": payload.case_id,
            "image": {
                "image_id": image_id,
                "path": payload.image.path,
                "modality": payload.image.modality,
                "storage_uri": payload.image.storage_uri,
            },
            "report": {
                "id": payload.report.id,
                "text": payload.report.text,
                "model": payload.report.model,
                "conf": payload.report.conf,
                "ts": payload.report.ts,
            },
            "findings": findings_param,
            "idempotency_key": payload.idempotency_key,
        });

        let query = if payload.image.storage_uri.as_deref().is_some_and(|uri| !uri.is_empty()) {
            UPSERT_CASE_BY_STORAGE_URI
        } else {
            UPSERT_CASE_BY_IMAGE_ID
        };

        let rows = self.store.run_write(query, parameters).await?;
        let receipt = rows
            .first()
            .map(|row| UpsertReceipt {
                image_id: row
                    .get("image_id")
                    .and_then(Value::as_str)
                    .unwrap_or(image_id)
                    .to_string(),
                finding_ids: string_list(row.get("finding_ids")),
            })
            .unwrap_or_else(|| UpsertReceipt {
                image_id: image_id.to_string(),
                finding_ids: Vec::new(),
            });

        tracing::debug!(
            "upsert_case image_id={} findings={} -> persisted {}",
            receipt.image_id,
            payload.findings.len(),
            receipt.finding_ids.len()
        );
        Ok(receipt)
    }

    /// Verification re-query for persisted finding ids.
    pub async fn fetch_finding_ids(
        &self,
        image_id: &str,
        expected_ids: Option<&[String]>,
    ) -> ApiResult<Vec<String>> {
        let parameters = json!({
            "image_id": image_id,
            "expected_ids": expected_ids,
        });
        let rows = self.store.run_read(FINDING_IDS_QUERY, parameters).await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    /// Per-relation edge summary plus the facts payload.
    pub async fn query_bundle(&self, image_id: &str) -> ApiResult<BundlePayload> {
        let parameters = json!({ "image_id": image_id });
        let summary_rows = self
            .store
            .run_read(EDGE_SUMMARY_QUERY, parameters.clone())
            .await?
            .iter()
            .filter_map(|row| {
                Some(SummaryRow {
                    rel: row.get("rel")?.as_str()?.to_string(),
                    cnt: row.get("cnt").and_then(Value::as_u64).unwrap_or(0),
                    avg_conf: row.get("avg_conf").and_then(Value::as_f64),
                })
            })
            .collect();

        let fact_rows = self.store.run_read(FACTS_QUERY, parameters).await?;
        let facts = fact_rows
            .first()
            .map(|row| ContextFacts {
                image_id: row
                    .get("image_id")
                    .and_then(Value::as_str)
                    .unwrap_or(image_id)
                    .to_string(),
                findings: row
                    .get("findings")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|item| {
                                serde_json::from_value::<FactFinding>(item.clone()).ok()
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .unwrap_or_else(|| ContextFacts {
                image_id: image_id.to_string(),
                findings: Vec::new(),
            });

        Ok(BundlePayload { summary_rows, facts })
    }

    /// Ranked evidence paths honouring the per-slot budgets. `alpha`/`beta`
    /// override the finding/location weights of the path score.
    pub async fn query_paths(
        &self,
        image_id: &str,
        slots: SlotLimits,
        alpha_finding: Option<f64>,
        beta_report: Option<f64>,
    ) -> ApiResult<Vec<EvidencePath>> {
        let alpha = alpha_finding.unwrap_or(0.6);
        let beta = beta_report.unwrap_or(0.3);
        let mut paths = Vec::new();

        if slots.findings > 0 {
            let parameters = json!({
                "image_id": image_id,
                "alpha": alpha,
                "beta": beta,
                "limit": slots.findings as i64,
            });
            for row in self.store.run_read(FINDING_PATHS_QUERY, parameters).await? {
                let finding_id =
                    row.get("finding_id").and_then(Value::as_str).unwrap_or("").to_string();
                if finding_id.is_empty() {
                    continue;
                }
                let mut triples =
                    vec![format!("Image[{}] -HAS_FINDING-> Finding[{}]", image_id, finding_id)];
                if let Some(anatomy) = row.get("anatomy").and_then(Value::as_str) {
                    triples.push(format!(
                        "Finding[{}] -LOCATED_IN-> Anatomy[{}]",
                        finding_id, anatomy
                    ));
                }
                let label = row
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Finding[{}]", finding_id));
                paths.push(EvidencePath {
                    label,
                    triples,
                    score: row.get("score").and_then(Value::as_f64),
                    slot: Some(Slot::Findings),
                });
            }
        }

        if slots.reports > 0 {
            let parameters = json!({ "image_id": image_id, "limit": slots.reports as i64 });
            for row in self.store.run_read(REPORT_PATHS_QUERY, parameters).await? {
                let report_id =
                    row.get("report_id").and_then(Value::as_str).unwrap_or("").to_string();
                if report_id.is_empty() {
                    continue;
                }
                let label = row
                    .get("model")
                    .and_then(Value::as_str)
                    .map(|m| format!("Report by {}", m))
                    .unwrap_or_else(|| format!("Report[{}]", report_id));
                paths.push(EvidencePath {
                    label,
                    triples: vec![format!(
                        "Image[{}] -DESCRIBED_BY-> Report[{}]",
                        image_id, report_id
                    )],
                    score: row.get("score").and_then(Value::as_f64),
                    slot: Some(Slot::Reports),
                });
            }
        }

        if slots.similarity > 0 {
            let parameters = json!({ "image_id": image_id, "limit": slots.similarity as i64 });
            for row in self.store.run_read(SIMILARITY_PATHS_QUERY, parameters).await? {
                let other_id =
                    row.get("other_id").and_then(Value::as_str).unwrap_or("").to_string();
                if other_id.is_empty() {
                    continue;
                }
                let label = row
                    .get("basis")
                    .and_then(Value::as_str)
                    .map(|basis| format!("Similar via {}", basis))
                    .unwrap_or_else(|| "Similar image".to_string());
                paths.push(EvidencePath {
                    label,
                    triples: vec![format!(
                        "Image[{}] -SIMILAR_TO-> Image[{}]",
                        image_id, other_id
                    )],
                    score: row.get("score").and_then(Value::as_f64),
                    slot: Some(Slot::Similarity),
                });
            }
        }

        Ok(paths)
    }

    /// Other seeded images with their finding/anatomy token sets.
    pub async fn fetch_similarity_candidates(
        &self,
        image_id: &str,
    ) -> ApiResult<Vec<SimilarityCandidate>> {
        let parameters = json!({ "image_id": image_id });
        let rows = self.store.run_read(SIMILARITY_CANDIDATES_QUERY, parameters).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| serde_json::from_value::<SimilarityCandidate>(row).ok())
            .filter(|candidate| !candidate.image_id.is_empty())
            .collect())
    }

    /// Merge SIMILAR_TO edges; returns the number of edges written.
    pub async fn sync_similarity_edges(
        &self,
        image_id: &str,
        edges: &[SimilarityEdge],
    ) -> ApiResult<usize> {
        if edges.is_empty() {
            return Ok(0);
        }
        let parameters = json!({ "image_id": image_id, "edges": edges });
        let rows = self.store.run_write(SYNC_SIMILARITY_EDGES_QUERY, parameters).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("created"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items.iter().filter_map(Value::as_str).map(str::to_string).collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::graph_store::mock::MockGraphStore;

    fn upsert_payload(storage_uri: Option<&str>) -> CaseUpsert {
        CaseUpsert {
            case_id: "CASE_IMG_001".to_string(),
            image: ImageRecord {
                image_id: Some("IMG_001".to_string()),
                path: Some("/tmp/img_001.png".to_string()),
                modality: Some("XR".to_string()),
                storage_uri: storage_uri.map(str::to_string),
                storage_uri_key: None,
            },
            report: ReportRecord {
                id: "R_abc".to_string(),
                text: "nodule in right middle lobe".to_string(),
                model: Some("qwen2-vl".to_string()),
                conf: 0.8,
                ts: "2026-01-01T00:00:00Z".to_string(),
            },
            findings: vec![FindingRecord {
                id: "f_1".to_string(),
                r#type: Some("Nodule".to_string()),
                location: Some("Right middle lobe".to_string()),
                size_cm: Some(1.2),
                conf: Some(0.85),
                source: None,
            }],
            idempotency_key: Some("idem-1".to_string()),
        }
    }

    #[tokio::test]
    async fn upsert_uses_storage_uri_merge_when_available() {
        let store = Arc::new(MockGraphStore::new());
        store.respond(
            "MERGE (i:Image {storage_uri:",
            vec![json!({ "image_id": "IMG_001", "finding_ids": ["f_1"] })],
        );
        let repo = GraphRepo::new(store.clone());

        let receipt = repo
            .upsert_case(&upsert_payload(Some("/mnt/data/medical_dummy/images/img_001.png")))
            .await
            .expect("upsert ok");
        assert_eq!(receipt.image_id, "IMG_001");
        assert_eq!(receipt.finding_ids, vec!["f_1"]);
        assert!(store.executed()[0].contains("storage_uri:$image.storage_uri"));
    }

    #[tokio::test]
    async fn upsert_falls_back_to_image_id_merge() {
        let store = Arc::new(MockGraphStore::new());
        store.respond(
            "MERGE (i:Image {image_id:",
            vec![json!({ "image_id": "IMG_001", "finding_ids": [] })],
        );
        let repo = GraphRepo::new(store.clone());

        repo.upsert_case(&upsert_payload(None)).await.expect("upsert ok");
        assert!(store.executed()[0].contains("image_id:$image.image_id"));
    }

    #[tokio::test]
    async fn upsert_rejects_non_canonical_type() {
        let store = Arc::new(MockGraphStore::new());
        let repo = GraphRepo::new(store);
        let mut payload = upsert_payload(None);
        payload.findings[0].r#type = Some("quasar".to_string());

        let err = repo.upsert_case(&payload).await.unwrap_err();
        match err {
            ApiError::InvalidInput(msg) => assert!(msg.contains("finding[0].type")),
            other => panic!("expected InvalidInput, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn query_paths_respects_zero_slots() {
        let store = Arc::new(MockGraphStore::new());
        let repo = GraphRepo::new(store.clone());

        let slots = SlotLimits { findings: 0, reports: 0, similarity: 0 };
        let paths = repo.query_paths("IMG_001", slots, None, None).await.expect("query ok");
        assert!(paths.is_empty());
        assert!(store.executed().is_empty());
    }

    #[tokio::test]
    async fn query_paths_builds_triples_per_slot() {
        let store = Arc::new(MockGraphStore::new());
        store.respond(
            "RETURN f.id AS finding_id",
            vec![json!({
                "finding_id": "f_1",
                "type": "Nodule",
                "anatomy": "Right middle lobe",
                "score": 0.82,
            })],
        );
        store.respond(
            "RETURN r.id AS report_id",
            vec![json!({ "report_id": "R_abc", "model": "qwen2-vl", "score": 0.8 })],
        );
        let repo = GraphRepo::new(store);

        let slots = SlotLimits { findings: 2, reports: 1, similarity: 0 };
        let paths = repo.query_paths("IMG_001", slots, None, None).await.expect("query ok");
        assert_eq!(paths.len(), 2);
        assert_eq!(
            paths[0].triples,
            vec![
                "Image[IMG_001] -HAS_FINDING-> Finding[f_1]".to_string(),
                "Finding[f_1] -LOCATED_IN-> Anatomy[Right middle lobe]".to_string(),
            ]
        );
        assert_eq!(paths[0].slot, Some(Slot::Findings));
        assert_eq!(paths[1].slot, Some(Slot::Reports));
    }

    #[tokio::test]
    async fn sync_similarity_edges_skips_empty_batches() {
        let store = Arc::new(MockGraphStore::new());
        let repo = GraphRepo::new(store.clone());
        let created = repo.sync_similarity_edges("IMG_001", &[]).await.expect("ok");
        assert_eq!(created, 0);
        assert!(store.executed().is_empty());
    }

    #[tokio::test]
    async fn fetch_finding_ids_passes_expected_filter() {
        let store = Arc::new(MockGraphStore::new());
        store.respond("WHERE $expected_ids IS NULL", vec![json!({ "id": "f_1" })]);
        let repo = GraphRepo::new(store.clone());

        let expected = vec!["f_1".to_string()];
        let ids = repo.fetch_finding_ids("IMG_001", Some(&expected)).await.expect("ok");
        assert_eq!(ids, vec!["f_1"]);
        let (_, params) = store.statements.lock().unwrap()[0].clone();
        assert_eq!(params["expected_ids"], json!(["f_1"]));
    }
}
