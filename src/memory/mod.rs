//! 记忆层：会话日志条目、可插拔后端（ephemeral / filesystem / long-term / composite）、
//! token 估算与上下文压缩

pub mod backend;
pub mod compactor;
pub mod composite;
pub mod conversation;
pub mod ephemeral;
pub mod filesystem;
pub mod long_term;
pub mod manager;
pub mod token_budget;

pub use backend::{BackendTag, MemoryBackend, MemoryError, MemoryKey, MemoryRecord, ReadRange};
pub use compactor::{
    plan_compaction, CompactionPlan, CompactionPolicy, ExtractiveSummarizer, ModelSummarizer, Summarizer,
};
pub use composite::CompositeBackend;
pub use conversation::{
    dangling_calls, orphaned_results, CompactionSummary, Message, Role, ToolCallRequest, ToolCallResult,
    ToolOutcome,
};
pub use ephemeral::EphemeralBackend;
pub use filesystem::FilesystemBackend;
pub use long_term::LongTermBackend;
pub use manager::{CompactionReport, MemoryManager};
pub use token_budget::TokenEstimator;
