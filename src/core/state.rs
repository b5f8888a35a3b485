//! 会话状态机与对外投影
//!
//! 每个用户轮次从 Planning 开始，终止于 Done / Failed；Failed 可由任意状态到达。
//! SessionSnapshot 是会话的轻量投影，由后台会话任务通过 watch 通道发布。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::ReasonCode;
use crate::llm::TokenUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Planning,
    Acting,
    Verifying,
    AwaitingApproval,
    Delegating,
    Responding,
    Done,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Planning => "planning",
            SessionState::Acting => "acting",
            SessionState::Verifying => "verifying",
            SessionState::AwaitingApproval => "awaiting_approval",
            SessionState::Delegating => "delegating",
            SessionState::Responding => "responding",
            SessionState::Done => "done",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }

    /// 转移表
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        if next == Failed {
            return *self != Failed;
        }
        match self {
            // 纠正提示 / JSON 重试会停留在 Planning
            Planning => matches!(next, Planning | Acting | Verifying),
            Acting => matches!(next, AwaitingApproval | Delegating | Verifying),
            AwaitingApproval => matches!(next, Delegating | Verifying),
            Delegating => matches!(next, Verifying),
            Verifying => matches!(next, Planning | Responding),
            Responding => matches!(next, Done),
            // 新轮次
            Done | Failed => matches!(next, Planning),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话的对外投影（轻量、可序列化）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub state: SessionState,
    pub turns: usize,
    /// 是否有轮次正在执行
    pub busy: bool,
    pub token_budget_remaining: usize,
    pub usage: TokenUsage,
    pub active_subagents: usize,
    pub last_reason: Option<ReasonCode>,
    pub closed: bool,
}
