pub mod pipeline;

pub use pipeline::{
    AnalyzeParameters, AnalyzeRequest, AnalyzeResponse, Confidence, ConsensusResult,
    ConsensusStatus, ContextBundle, ContextFacts, Degraded, EvaluationConsensus,
    EvaluationPayload, EvidencePath, FactFinding, FallbackMeta, FindingRecord, ImageRecord, Mode,
    ModeOutput, ModeResults, NormalizedBundle, ProvenancePayload, ReportRecord, SimilarImage,
    SimilarityEdge, Slot, SlotLimits, SlotMeta, SummaryRow, Timings,
};
