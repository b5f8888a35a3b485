//! 错误类型、失败原因码与恢复动作
//!
//! 两类错误：
//! - **AgentError**：编排层错误，可能终止当前轮次（模型失败、记忆后端损坏、配置错误、取消）
//! - **ToolFailure**：数据化的工具失败，写入消息日志并反馈给 Planner，从不作为未处理异常抛出
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 RetryWithPrompt / SummarizeAndPrune / Abort。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::SessionState;
use crate::memory::MemoryError;

/// 编排过程中的错误（模型、上下文、记忆、配置、状态机）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 模型调用在自身重试预算耗尽后仍失败
    #[error("Model error: {0}")]
    ModelError(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Context window exceeded")]
    ContextWindowExceeded,

    #[error("Token budget exceeded: estimated {estimated} tokens, limit {limit}")]
    TokenBudgetExceeded { estimated: usize, limit: usize },

    #[error("Memory backend error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Cancelled")]
    Cancelled,

    #[error("Session closed")]
    SessionClosed,
}

impl AgentError {
    /// 用户可见的稳定原因码
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            AgentError::ModelError(_) | AgentError::JsonParseError(_) => ReasonCode::ModelError,
            AgentError::ContextWindowExceeded | AgentError::TokenBudgetExceeded { .. } => {
                ReasonCode::TokenBudgetExceeded
            }
            AgentError::Memory(_) => ReasonCode::MemoryBackendError,
            AgentError::ConfigError(_) => ReasonCode::ConfigError,
            AgentError::InvalidTransition { .. } => ReasonCode::InternalError,
            AgentError::Cancelled => ReasonCode::Cancelled,
            AgentError::SessionClosed => ReasonCode::SessionClosed,
        }
    }

    /// 是否致命：会话无法可靠继续（记忆后端损坏、配置错误、状态机错误）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::Memory(_) | AgentError::ConfigError(_) | AgentError::InvalidTransition { .. }
        )
    }
}

/// 用户可见失败的稳定原因码（snake_case，序列化后不随版本变化）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    ModelError,
    GuardrailBlocked,
    PolicyBlocked,
    PriceCeilingExceeded,
    LowConfidence,
    MissingCitation,
    UnknownSku,
    ToolNotAllowed,
    InvalidArguments,
    RateLimited,
    ToolBackendError,
    ApprovalDenied,
    ApprovalTimedOut,
    SubagentFailure,
    MemoryBackendError,
    TokenBudgetExceeded,
    StepLimitExceeded,
    VerificationFailed,
    Cancelled,
    Unresolved,
    SessionClosed,
    ConfigError,
    InternalError,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::ModelError => "model_error",
            ReasonCode::GuardrailBlocked => "guardrail_blocked",
            ReasonCode::PolicyBlocked => "policy_blocked",
            ReasonCode::PriceCeilingExceeded => "price_ceiling_exceeded",
            ReasonCode::LowConfidence => "low_confidence",
            ReasonCode::MissingCitation => "missing_citation",
            ReasonCode::UnknownSku => "unknown_sku",
            ReasonCode::ToolNotAllowed => "tool_not_allowed",
            ReasonCode::InvalidArguments => "invalid_arguments",
            ReasonCode::RateLimited => "rate_limited",
            ReasonCode::ToolBackendError => "tool_backend_error",
            ReasonCode::ApprovalDenied => "approval_denied",
            ReasonCode::ApprovalTimedOut => "approval_timed_out",
            ReasonCode::SubagentFailure => "subagent_failure",
            ReasonCode::MemoryBackendError => "memory_backend_error",
            ReasonCode::TokenBudgetExceeded => "token_budget_exceeded",
            ReasonCode::StepLimitExceeded => "step_limit_exceeded",
            ReasonCode::VerificationFailed => "verification_failed",
            ReasonCode::Cancelled => "cancelled",
            ReasonCode::Unresolved => "unresolved",
            ReasonCode::SessionClosed => "session_closed",
            ReasonCode::ConfigError => "config_error",
            ReasonCode::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 工具步骤的数据化失败：随 ToolResult 写入日志并在下一轮 PLANNING 反馈给模型
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolFailure {
    #[error("tool '{tool}' is not allowed")]
    NotAllowed { tool: String },

    #[error("invalid arguments for '{tool}': {detail}")]
    InvalidArguments { tool: String, detail: String },

    #[error("rate limit reached for '{tool}'")]
    RateLimited { tool: String },

    #[error("tool backend error: {message}")]
    Backend { message: String, transient: bool },

    #[error("blocked by guardrail '{check}': {reason}")]
    GuardrailBlocked {
        check: String,
        code: ReasonCode,
        reason: String,
    },

    #[error("approval denied by {actor}")]
    ApprovalDenied { actor: String, note: Option<String> },

    #[error("approval timed out before a decision arrived")]
    ApprovalTimedOut,

    #[error("subagent '{specialist}' failed: {summary}")]
    Subagent { specialist: String, summary: String },

    #[error("cancelled")]
    Cancelled,

    #[error("unresolved: {reason}")]
    Unresolved { reason: String },
}

impl ToolFailure {
    pub fn code(&self) -> ReasonCode {
        match self {
            ToolFailure::NotAllowed { .. } => ReasonCode::ToolNotAllowed,
            ToolFailure::InvalidArguments { .. } => ReasonCode::InvalidArguments,
            ToolFailure::RateLimited { .. } => ReasonCode::RateLimited,
            ToolFailure::Backend { .. } => ReasonCode::ToolBackendError,
            ToolFailure::GuardrailBlocked { code, .. } => *code,
            ToolFailure::ApprovalDenied { .. } => ReasonCode::ApprovalDenied,
            ToolFailure::ApprovalTimedOut => ReasonCode::ApprovalTimedOut,
            ToolFailure::Subagent { .. } => ReasonCode::SubagentFailure,
            ToolFailure::Cancelled => ReasonCode::Cancelled,
            ToolFailure::Unresolved { .. } => ReasonCode::Unresolved,
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 将纠正提示注入下一轮，让模型重新规划（如 JSON 格式错误）
    RetryWithPrompt(String),
    /// 压缩上下文后继续（如超长上下文）
    SummarizeAndPrune,
    /// 终止当前轮次，原因透传给调用方
    Abort,
}
