//! Reasoning mode runners: V (caption only), VL (caption + language
//! rewrite) and VGL (graph-grounded + language), with the VGL-to-VL
//! degradation policy.

use crate::models::{Degraded, ModeOutput, NormalizedBundle};
use crate::services::llm_runner::LlmService;
use crate::services::normalizer::clamp_one_line;
use crate::utils::{ApiError, ApiResult};

const CAPTION_TO_SUMMARY_PROMPT: &str = "[Image Caption]\n{caption}\n\n[Task]\n\
위 캡션만 근거로, 한국어 한 줄 소견을 작성하라.\n추정/상상 금지. 최대 30자.";

const GRAPH_TO_SUMMARY_PROMPT: &str = "[Graph Context]\n{context}\n\n[Task]\n\
위 컨텍스트만 근거로 한국어 한 줄 소견을 작성하라.\n\
새로운 사실 추가 금지. 불확실하면 \"추가 검사 권고\".\n최대 30자.";

pub const VGL_FALLBACK_REASON: &str = "graph context empty; fell back to VL";

fn require_caption(bundle: &NormalizedBundle) -> ApiResult<&str> {
    let caption = bundle.caption.trim();
    if caption.is_empty() {
        return Err(ApiError::invalid_input("caption is empty; nothing to summarise"));
    }
    Ok(caption)
}

/// V: the normalised caption clamped to the character budget. Deterministic,
/// no LLM call.
pub fn run_v_mode(bundle: &NormalizedBundle, max_chars: usize) -> ApiResult<ModeOutput> {
    let caption = require_caption(bundle)?;
    Ok(ModeOutput {
        text: clamp_one_line(caption, max_chars),
        latency_ms: 0,
        ..Default::default()
    })
}

/// VL: one-line Korean rewrite of the caption.
pub async fn run_vl_mode(
    llm: &dyn LlmService,
    bundle: &NormalizedBundle,
    max_chars: usize,
) -> ApiResult<ModeOutput> {
    let caption = require_caption(bundle)?;
    let prompt = CAPTION_TO_SUMMARY_PROMPT.replace("{caption}", caption);
    let generation = llm.generate(&prompt, 0.2).await;
    Ok(ModeOutput {
        text: clamp_one_line(&generation.output, max_chars),
        latency_ms: generation.latency_ms,
        warning: generation.warning,
        ..Default::default()
    })
}

/// VGL: one-line Korean summary grounded in the graph context; never
/// introduces new facts. Falls back to VL (marked degraded) when the graph
/// context is empty.
pub async fn run_vgl_mode(
    llm: &dyn LlmService,
    graph_context: &str,
    bundle: &NormalizedBundle,
    max_chars: usize,
    fallback_to_vl: bool,
) -> ApiResult<ModeOutput> {
    if graph_context.trim().is_empty() {
        if fallback_to_vl {
            let mut output = run_vl_mode(llm, bundle, max_chars).await?;
            output.degraded = Degraded::Vl;
            output.reason = Some(VGL_FALLBACK_REASON.to_string());
            return Ok(output);
        }
        return Ok(ModeOutput {
            text: "Graph findings unavailable".to_string(),
            latency_ms: 0,
            ..Default::default()
        });
    }

    let prompt = GRAPH_TO_SUMMARY_PROMPT.replace("{context}", graph_context);
    let generation = llm.generate(&prompt, 0.2).await;
    Ok(ModeOutput {
        text: clamp_one_line(&generation.output, max_chars),
        latency_ms: generation.latency_ms,
        warning: generation.warning,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm_runner::LlmGeneration;
    use async_trait::async_trait;

    struct CannedLlm {
        output: String,
    }

    #[async_trait]
    impl LlmService for CannedLlm {
        async fn generate(&self, _prompt: &str, _temperature: f64) -> LlmGeneration {
            LlmGeneration {
                output: self.output.clone(),
                model: "test-llm".to_string(),
                latency_ms: 7,
                warning: None,
            }
        }

        async fn health(&self) -> bool {
            true
        }

        fn model(&self) -> &str {
            "test-llm"
        }
    }

    fn bundle(caption: &str) -> NormalizedBundle {
        NormalizedBundle { caption: caption.to_string(), ..Default::default() }
    }

    #[test]
    fn v_mode_clamps_caption() {
        let output = run_v_mode(&bundle("a long   caption with   spaces"), 10).expect("v mode");
        assert_eq!(output.text, "a long cap");
        assert_eq!(output.latency_ms, 0);
        assert!(!output.degraded.is_degraded());
    }

    #[test]
    fn empty_caption_is_input_error() {
        let err = run_v_mode(&bundle("   "), 30).unwrap_err();
        assert!(matches!(err, ApiError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn vl_mode_returns_llm_text() {
        let llm = CannedLlm { output: "우상엽 결절 소견".to_string() };
        let output = run_vl_mode(&llm, &bundle("nodule in RUL"), 30).await.expect("vl mode");
        assert_eq!(output.text, "우상엽 결절 소견");
        assert_eq!(output.latency_ms, 7);
    }

    #[tokio::test]
    async fn vgl_mode_degrades_to_vl_without_context() {
        let llm = CannedLlm { output: "우상엽 결절 소견".to_string() };
        let output =
            run_vgl_mode(&llm, "  ", &bundle("nodule in RUL"), 30, true).await.expect("vgl");
        assert_eq!(output.degraded, Degraded::Vl);
        assert_eq!(output.reason.as_deref(), Some(VGL_FALLBACK_REASON));
    }

    #[tokio::test]
    async fn vgl_mode_reports_unavailable_when_fallback_disabled() {
        let llm = CannedLlm { output: "ignored".to_string() };
        let output =
            run_vgl_mode(&llm, "", &bundle("nodule in RUL"), 30, false).await.expect("vgl");
        assert_eq!(output.text, "Graph findings unavailable");
        assert!(!output.degraded.is_degraded());
    }

    #[tokio::test]
    async fn vgl_mode_uses_graph_context() {
        let llm = CannedLlm { output: "그래프 근거 소견".to_string() };
        let output = run_vgl_mode(&llm, "[EDGE SUMMARY]\n...", &bundle("caption"), 30, true)
            .await
            .expect("vgl");
        assert_eq!(output.text, "그래프 근거 소견");
        assert!(!output.degraded.is_degraded());
    }
}
