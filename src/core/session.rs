//! Session：一个会话的编排状态
//!
//! 由运行它的 Orchestrator 独占。消息日志本身存放在 MemoryManager 中（按 session id 寻址），
//! 这里保存状态机、状态历史、token 预算、会话事实与挂载的子智能体句柄。

use crate::config::SpecialistConfig;
use crate::core::{AgentError, SessionState};
use crate::guardrails::TurnFacts;
use crate::llm::TokenUsage;
use crate::subagent::SubagentHandle;

#[derive(Debug)]
pub struct Session {
    id: String,
    state: SessionState,
    history: Vec<SessionState>,
    token_budget: usize,
    usage: TokenUsage,
    facts: TurnFacts,
    subagents: Vec<SubagentHandle>,
    next_child: usize,
    turns: usize,
    closed: bool,
}

impl Session {
    pub fn new(id: impl Into<String>, token_budget: usize) -> Self {
        Self {
            id: id.into(),
            // 首轮之前视为上一轮已完成
            state: SessionState::Done,
            history: Vec::new(),
            token_budget,
            usage: TokenUsage::default(),
            facts: TurnFacts::new(),
            subagents: Vec::new(),
            next_child: 0,
            turns: 0,
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 全部轮次的状态序列
    pub fn state_history(&self) -> &[SessionState] {
        &self.history
    }

    pub fn turns(&self) -> usize {
        self.turns
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.subagents.clear();
    }

    /// 开始新一轮：进入 Planning，清空本轮检索片段
    pub fn begin_turn(&mut self) -> Result<(), AgentError> {
        if self.closed {
            return Err(AgentError::SessionClosed);
        }
        self.turns += 1;
        self.facts.begin_turn();
        self.transition(SessionState::Planning)
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), AgentError> {
        if !self.state.can_transition_to(next) {
            return Err(AgentError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(session = %self.id, from = %self.state, to = %next, "state transition");
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// 不校验地进入 Failed（Failed 可由任意状态到达；已是 Failed 时不重复记录）
    pub fn fail(&mut self) {
        if self.state != SessionState::Failed {
            self.state = SessionState::Failed;
            self.history.push(SessionState::Failed);
        }
    }

    pub fn facts(&self) -> &TurnFacts {
        &self.facts
    }

    pub fn facts_mut(&mut self) -> &mut TurnFacts {
        &mut self.facts
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn record_usage(&mut self, usage: TokenUsage) {
        self.usage.add(usage);
    }

    pub fn token_budget(&self) -> usize {
        self.token_budget
    }

    pub fn token_budget_remaining(&self) -> usize {
        self.token_budget.saturating_sub(self.usage.total() as usize)
    }

    pub fn budget_exhausted(&self) -> bool {
        self.token_budget_remaining() == 0
    }

    /// 为委派步骤创建并挂载子智能体句柄
    pub fn attach_subagent(&mut self, specialist: &SpecialistConfig, parent_step: &str) -> SubagentHandle {
        self.next_child += 1;
        let handle = SubagentHandle {
            child_session_id: format!("{}/sub-{}", self.id, self.next_child),
            specialist: specialist.name.clone(),
            allowed_tools: specialist.tools.clone(),
            parent_step: parent_step.to_string(),
            require_approval: false,
        };
        self.subagents.push(handle.clone());
        handle
    }

    /// 子智能体回报后销毁句柄
    pub fn detach_subagent(&mut self, child_session_id: &str) {
        self.subagents.retain(|h| h.child_session_id != child_session_id);
    }

    pub fn active_subagents(&self) -> &[SubagentHandle] {
        &self.subagents
    }
}
