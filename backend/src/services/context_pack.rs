//! Builds the slot-budgeted graph context bundle injected into VGL prompts:
//! edge summary, top-k evidence paths and the raw facts JSON, trimmed to a
//! character budget.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::models::{ContextBundle, ContextFacts, EvidencePath, Slot, SlotLimits, SlotMeta, SummaryRow};
use crate::services::dedup::dedup_paths;
use crate::services::graph_repo::GraphRepo;
use crate::utils::ApiResult;

const KNOWN_RELATIONS: &[&str] = &[
    "HAS_FINDING",
    "LOCATED_IN",
    "RELATED_TO",
    "DESCRIBED_BY",
    "HAS_IMAGE",
    "HAS_ENCOUNTER",
    "HAS_INFERENCE",
    "SIMILAR_TO",
];

static RELATION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-\s*([A-Z_]+)\s*->").unwrap());
static FINDING_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Finding\[([^\]]+)\]").unwrap());

/// Explicit per-slot budget overrides from the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotOverrides {
    pub findings: Option<usize>,
    pub reports: Option<usize>,
    pub similarity: Option<usize>,
}

impl SlotOverrides {
    pub fn is_empty(&self) -> bool {
        self.findings.is_none() && self.reports.is_none() && self.similarity.is_none()
    }

    fn as_map(&self) -> BTreeMap<String, usize> {
        let mut map = BTreeMap::new();
        if let Some(value) = self.findings {
            map.insert("findings".to_string(), value);
        }
        if let Some(value) = self.reports {
            map.insert("reports".to_string(), value);
        }
        if let Some(value) = self.similarity {
            map.insert("similarity".to_string(), value);
        }
        map
    }
}

#[derive(Debug, Clone, Default)]
pub struct BundleOptions {
    pub k: usize,
    pub max_chars: usize,
    pub alpha_finding: Option<f64>,
    pub beta_report: Option<f64>,
    pub k_slots: SlotOverrides,
}

/// Allocate the path budget across slots. Explicit overrides are capped at
/// the total; otherwise findings fill first (up to 2), then reports (up to
/// 2), then the remainder goes to similarity.
pub fn resolve_path_slots(total: usize, overrides: &SlotOverrides) -> SlotLimits {
    if !overrides.is_empty() {
        let explicit = SlotLimits {
            findings: overrides.findings.unwrap_or(0),
            reports: overrides.reports.unwrap_or(0),
            similarity: overrides.similarity.unwrap_or(0),
        };
        return cap_slots(explicit, total);
    }

    let mut slots = SlotLimits::default();
    let mut remaining = total;
    slots.findings = remaining.min(2);
    remaining -= slots.findings;
    slots.reports = remaining.min(2);
    remaining -= slots.reports;
    slots.similarity = remaining;
    slots
}

/// Cap the slot sum at `limit`, decrementing similarity, then reports,
/// then findings.
fn cap_slots(mut slots: SlotLimits, limit: usize) -> SlotLimits {
    if limit == 0 {
        return SlotLimits::default();
    }
    let order = [Slot::Similarity, Slot::Reports, Slot::Findings];
    while slots.total() > limit {
        let mut changed = false;
        for slot in order {
            if slots.get(slot) > 0 {
                slots.set(slot, slots.get(slot) - 1);
                changed = true;
                if slots.total() <= limit {
                    break;
                }
            }
        }
        if !changed {
            break;
        }
    }
    slots
}

/// Categorise a path into its slot, falling back to relation sniffing when
/// the repository did not tag it.
fn categorise_path_slot(path: &EvidencePath) -> Option<Slot> {
    if let Some(slot) = path.slot {
        return Some(slot);
    }
    for triple in &path.triples {
        if triple.contains("SIMILAR_TO") {
            return Some(Slot::Similarity);
        }
        if triple.contains("DESCRIBED_BY") || triple.contains("MENTIONS") {
            return Some(Slot::Reports);
        }
        if triple.contains("HAS_FINDING") {
            return Some(Slot::Findings);
        }
    }
    None
}

/// Shift budget away from starved slots towards slots that returned hits.
/// Reports and similarity are preferred when findings came back empty.
pub fn rebalance_slot_limits(slots: SlotLimits, paths: &[EvidencePath]) -> SlotLimits {
    let total = slots.total();
    if total == 0 {
        return slots;
    }

    let mut counts: HashMap<Slot, usize> = HashMap::new();
    for path in paths {
        if let Some(slot) = categorise_path_slot(path) {
            *counts.entry(slot).or_insert(0) += 1;
        }
    }

    let order: Vec<Slot> = if counts.get(&Slot::Findings).copied().unwrap_or(0) == 0 {
        vec![Slot::Reports, Slot::Similarity, Slot::Findings]
    } else {
        Slot::ALL.to_vec()
    };

    let mut rebalanced = SlotLimits::default();
    let mut remaining = total;

    let primary: Vec<Slot> =
        order.iter().copied().filter(|slot| counts.get(slot).copied().unwrap_or(0) > 0).collect();
    let secondary: Vec<Slot> =
        order.iter().copied().filter(|slot| !primary.contains(slot)).collect();

    for slot in &primary {
        if remaining == 0 {
            break;
        }
        let desired = slots.get(*slot).max(1);
        let allocation = remaining.min(desired);
        rebalanced.set(*slot, allocation);
        remaining -= allocation;
    }

    for slot in &secondary {
        if remaining == 0 {
            break;
        }
        if rebalanced.get(*slot) == 0 {
            rebalanced.set(*slot, 1);
            remaining -= 1;
        }
    }

    let mut distribution_order: Vec<Slot> =
        order.iter().copied().filter(|slot| rebalanced.get(*slot) > 0).collect();
    if distribution_order.is_empty() {
        distribution_order = order;
    }
    let mut idx = 0;
    while remaining > 0 && !distribution_order.is_empty() {
        let slot = distribution_order[idx % distribution_order.len()];
        rebalanced.set(slot, rebalanced.get(slot) + 1);
        remaining -= 1;
        idx += 1;
    }

    rebalanced
}

fn extract_relation(token: &str) -> Option<&str> {
    let captures = RELATION_PATTERN.captures(token)?;
    let relation = captures.get(1)?.as_str();
    KNOWN_RELATIONS.iter().find(|known| **known == relation).copied()
}

/// Fold path-derived relations back into the raw summary, computing average
/// confidence from per-finding or per-similarity scores where available.
pub fn augment_summary_rows(
    summary_rows: &[SummaryRow],
    paths: &[EvidencePath],
    facts: &ContextFacts,
) -> Vec<SummaryRow> {
    let mut summary_map: HashMap<String, SummaryRow> =
        summary_rows.iter().map(|row| (row.rel.clone(), row.clone())).collect();

    let finding_conf_map: HashMap<String, Option<f64>> = facts
        .findings
        .iter()
        .filter_map(|finding| finding.id.clone().map(|id| (id, finding.conf)))
        .collect();

    let mut fallback_counts: HashMap<&str, (u64, Vec<f64>)> = HashMap::new();
    for path in paths {
        for triple in &path.triples {
            let Some(relation) = extract_relation(triple) else { continue };
            let entry = fallback_counts.entry(relation).or_insert((0, Vec::new()));
            entry.0 += 1;
            let confidence = match relation {
                "HAS_FINDING" => FINDING_ID_PATTERN
                    .captures(triple)
                    .and_then(|captures| finding_conf_map.get(&captures[1]).copied())
                    .flatten(),
                "SIMILAR_TO" => path.score,
                _ => None,
            };
            if let Some(value) = confidence {
                entry.1.push(value);
            }
        }
    }

    for (relation, (cnt, confs)) in &fallback_counts {
        if summary_map.contains_key(*relation) || *cnt == 0 {
            continue;
        }
        let avg_conf = if confs.is_empty() {
            None
        } else {
            Some(((confs.iter().sum::<f64>() / confs.len() as f64) * 100.0).round() / 100.0)
        };
        summary_map.insert(
            relation.to_string(),
            SummaryRow { rel: relation.to_string(), cnt: *cnt, avg_conf },
        );
    }

    let mut ordered = Vec::new();
    for relation in KNOWN_RELATIONS {
        if let Some(row) = summary_map.remove(*relation) {
            ordered.push(row);
        }
    }
    let mut extras: Vec<SummaryRow> = summary_map.into_values().collect();
    extras.sort_by(|a, b| a.rel.cmp(&b.rel));
    ordered.extend(extras);
    ordered
}

fn render_edge_summary_lines(rows: &[SummaryRow]) -> Vec<String> {
    let mut lines = vec!["[EDGE SUMMARY]".to_string()];
    if rows.is_empty() {
        lines.push("데이터 없음".to_string());
        return lines;
    }
    for row in rows {
        let conf_str = match row.avg_conf {
            Some(conf) => format!("{:.2}", conf),
            None => "?".to_string(),
        };
        lines.push(format!("{}: cnt={}, avg_conf={}", row.rel, row.cnt, conf_str));
    }
    lines
}

fn format_evidence_section(paths: &[EvidencePath]) -> String {
    let mut lines = vec!["[EVIDENCE PATHS (Top-k)]".to_string()];
    if paths.is_empty() {
        lines.push("데이터 없음".to_string());
        return lines.join("\n");
    }
    for (idx, path) in paths.iter().enumerate() {
        let slot_prefix = path.slot.map(|slot| format!("[{}] ", slot)).unwrap_or_default();
        lines.push(format!("{}) {}{}", idx + 1, slot_prefix, path.label));
        for triple in &path.triples {
            lines.push(format!("   {}", triple));
        }
    }
    lines.join("\n")
}

struct Rendered {
    summary_rows: Vec<SummaryRow>,
    paths: Vec<EvidencePath>,
    triples_text: String,
}

fn render(
    summary_rows: &[SummaryRow],
    paths: Vec<EvidencePath>,
    facts: &ContextFacts,
) -> Rendered {
    let effective_rows = augment_summary_rows(summary_rows, &paths, facts);
    let summary_text = render_edge_summary_lines(&effective_rows).join("\n");
    let evidence_section = format_evidence_section(&paths);
    let facts_json =
        serde_json::to_string_pretty(facts).unwrap_or_else(|_| "{}".to_string());
    let triples_text =
        [summary_text, evidence_section, "[FACTS JSON]".to_string(), facts_json].join("\n");
    Rendered { summary_rows: effective_rows, paths, triples_text }
}

/// Fetches and formats graph-derived context for LLM prompts.
pub struct GraphContextBuilder {
    repo: GraphRepo,
}

impl GraphContextBuilder {
    pub fn new(repo: GraphRepo) -> Self {
        Self { repo }
    }

    /// Build the context bundle: query paths under the current slot
    /// allocation, rebalance once per unique slot signature when starved,
    /// shrink k until the render fits the character budget, then hard-trim.
    pub async fn build_bundle(
        &self,
        image_id: &str,
        opts: &BundleOptions,
    ) -> ApiResult<ContextBundle> {
        let requested_k = opts.k;
        let bundle_payload = self.repo.query_bundle(image_id).await?;
        let summary_rows = bundle_payload.summary_rows;
        let facts = bundle_payload.facts;

        let mut current_k = requested_k;
        let mut slot_limits = resolve_path_slots(current_k, &opts.k_slots);
        let mut attempted: HashSet<(usize, usize, usize)> = HashSet::new();
        let mut retried_findings = false;
        let mut rendered: Option<Rendered> = None;
        let mut final_slot_limits = slot_limits;

        loop {
            let signature = (slot_limits.findings, slot_limits.reports, slot_limits.similarity);
            if !attempted.insert(signature) {
                break;
            }

            let raw_paths = self
                .repo
                .query_paths(image_id, slot_limits, opts.alpha_finding, opts.beta_report)
                .await?;
            let paths = dedup_paths(raw_paths);

            let total_budget = slot_limits.total();
            let desired_paths = if current_k == 0 {
                total_budget
            } else if total_budget > 0 {
                current_k.min(total_budget)
            } else {
                current_k
            };

            if opts.k_slots.is_empty() && desired_paths > 0 && paths.len() < desired_paths {
                let rebalanced = rebalance_slot_limits(slot_limits, &paths);
                if rebalanced != slot_limits {
                    let findings_starved = paths
                        .iter()
                        .filter(|path| categorise_path_slot(path) == Some(Slot::Findings))
                        .count()
                        == 0;
                    if findings_starved {
                        retried_findings = true;
                    }
                    slot_limits = rebalanced;
                    continue;
                }
            }

            let candidate = render(&summary_rows, paths, &facts);
            if opts.max_chars > 0
                && candidate.triples_text.chars().count() > opts.max_chars
                && current_k > 0
            {
                current_k -= 1;
                slot_limits = resolve_path_slots(current_k, &opts.k_slots);
                attempted.clear();
                continue;
            }

            final_slot_limits = slot_limits;
            rendered = Some(candidate);
            break;
        }

        let rendered = rendered.unwrap_or_else(|| render(&summary_rows, Vec::new(), &facts));

        let mut triples_text = rendered.triples_text;
        if opts.max_chars > 0 && triples_text.chars().count() > opts.max_chars {
            let trimmed: String = triples_text.chars().take(opts.max_chars - 1).collect();
            triples_text = format!("{}…", trimmed.trim_end());
        }

        let summary_lines = render_edge_summary_lines(&rendered.summary_rows);
        let slot_meta = SlotMeta {
            requested_k,
            applied_k: current_k,
            slot_source: if opts.k_slots.is_empty() { "auto" } else { "overrides" }.to_string(),
            requested_overrides: opts.k_slots.as_map(),
            allocated_total: final_slot_limits.total(),
            retried_findings: retried_findings.then_some(true),
        };

        Ok(ContextBundle {
            summary: summary_lines,
            summary_rows: rendered.summary_rows,
            paths: rendered.paths,
            facts,
            triples: triples_text,
            slot_limits: final_slot_limits,
            slot_meta,
            finding_source: None,
            seeded_finding_ids: None,
            finding_fallback: None,
            finding_provenance: None,
        })
    }
}

/// Guarantee the findings slot can hold at least `minimum` fallback paths.
pub fn ensure_findings_slot_allocation(bundle: &mut ContextBundle, minimum: usize) {
    if minimum == 0 {
        return;
    }
    bundle.slot_limits.findings = bundle.slot_limits.findings.max(minimum);
    bundle.slot_meta.allocated_total =
        bundle.slot_meta.allocated_total.max(bundle.slot_limits.total());
}
