pub mod consensus;
pub mod context_pack;
pub mod debug_payload;
pub mod dedup;
pub mod dummy_registry;
pub mod fallback_meta;
pub mod finding_validation;
pub mod graph_repo;
pub mod graph_store;
pub mod image_identity;
pub mod llm_runner;
pub mod modes;
pub mod normalizer;
pub mod ontology_map;
pub mod safety;
pub mod similarity;
pub mod vlm_runner;

pub use context_pack::{BundleOptions, GraphContextBuilder, SlotOverrides};
pub use debug_payload::DebugPayloadBuilder;
pub use dummy_registry::DummyRegistry;
pub use fallback_meta::FallbackMetaGuard;
pub use graph_repo::{CaseUpsert, GraphRepo, UpsertReceipt};
pub use graph_store::{GraphStore, HttpGraphStore};
pub use llm_runner::{LlmRunner, LlmService};
pub use vlm_runner::{VlmRunner, VlmService};
