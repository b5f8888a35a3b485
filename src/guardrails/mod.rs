//! 护栏：模型调用与工具调用前后的有序检查（长度、禁用词、PII 脱敏、价格上限、相关性、引用、SKU 存在性）

pub mod checks;
pub mod facts;
pub mod pipeline;
pub mod policy;

pub use checks::{default_checks, GuardrailCheck, GuardrailInput, GuardrailPhase, GuardrailVerdict};
pub use facts::{extract_facts, Passage, TurnFacts};
pub use pipeline::{BlockedBy, GuardrailPipeline, PipelineOutcome};
pub use policy::{GuardrailPolicy, REDACTION};
