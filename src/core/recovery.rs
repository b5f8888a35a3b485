//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供轮次循环决定是重新规划、压缩上下文还是终止。

use crate::core::{AgentError, RecoveryAction};

#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::JsonParseError(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous output was not valid JSON ({raw}). To call tools, output exactly one JSON \
                 object such as {{\"tool\": \"catalog_search\", \"args\": {{\"query\": \"kettle\"}}}} or \
                 {{\"calls\": [...]}}. To answer the user, reply with plain text."
            )),
            AgentError::ContextWindowExceeded => RecoveryAction::SummarizeAndPrune,
            AgentError::ModelError(_)
            | AgentError::TokenBudgetExceeded { .. }
            | AgentError::Memory(_)
            | AgentError::ConfigError(_)
            | AgentError::InvalidTransition { .. }
            | AgentError::Cancelled
            | AgentError::SessionClosed => RecoveryAction::Abort,
        }
    }
}
