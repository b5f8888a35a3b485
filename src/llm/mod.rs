//! LLM 层：客户端抽象、重试包装与脚本化测试客户端
//!
//! 具体 provider 客户端不在本 crate 内，调用方实现 LlmClient 接入。

pub mod scripted;
pub mod traits;

pub use scripted::ScriptedLlmClient;
pub use traits::{LlmClient, LlmError, ModelReply, RetryConfig, RetryingLlmClient, TokenUsage, ToolDescriptor};
