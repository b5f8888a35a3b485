//! 会话日志条目：消息、工具调用请求与结果
//!
//! Message 即持久化的会话日志条目 `{role, content, tool_calls[], tool_results[], timestamp, run_id}`。
//! 日志只追加；工具调用请求必须最终配对恰好一个结果（或显式的 unresolved 标记）。

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::ToolFailure;

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
    /// 纠正提示、压缩摘要等系统注记
    System,
}

/// 模型请求的一次工具调用；`specialist` 非空表示该步骤委派给子智能体
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialist: Option<String>,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, tool: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            args,
            specialist: None,
        }
    }

    /// 委派步骤：交给指定专家子智能体处理 task
    pub fn delegate(id: impl Into<String>, specialist: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool: "delegate".to_string(),
            args: serde_json::json!({ "task": task.into() }),
            specialist: Some(specialist.into()),
        }
    }

    pub fn is_delegation(&self) -> bool {
        self.specialist.is_some()
    }
}

/// 工具步骤结果：成功载荷或数据化失败
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { payload: Value },
    Failure { error: ToolFailure },
}

impl ToolOutcome {
    pub fn success(payload: Value) -> Self {
        ToolOutcome::Success { payload }
    }

    pub fn failure(error: ToolFailure) -> Self {
        ToolOutcome::Failure { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success { .. })
    }

    pub fn failure_ref(&self) -> Option<&ToolFailure> {
        match self {
            ToolOutcome::Failure { error } => Some(error),
            ToolOutcome::Success { .. } => None,
        }
    }

    /// 供模型阅读的单行文本
    pub fn render(&self) -> String {
        match self {
            ToolOutcome::Success { payload } => payload.to_string(),
            ToolOutcome::Failure { error } => format!("Error [{}]: {}", error.code(), error),
        }
    }
}

/// 与某个 ToolCallRequest 配对的结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub call_id: String,
    pub tool: String,
    pub outcome: ToolOutcome,
}

impl ToolCallResult {
    pub fn new(call_id: impl Into<String>, tool: impl Into<String>, outcome: ToolOutcome) -> Self {
        Self {
            call_id: call_id.into(),
            tool: tool.into(),
            outcome,
        }
    }

    /// 终态 unresolved 标记
    pub fn unresolved(request: &ToolCallRequest, reason: impl Into<String>) -> Self {
        Self::new(
            request.id.clone(),
            request.tool.clone(),
            ToolOutcome::failure(ToolFailure::Unresolved {
                reason: reason.into(),
            }),
        )
    }
}

/// 压缩摘要条目附带的元数据
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompactionSummary {
    /// 被替换的原始条目数
    pub replaced: usize,
    /// 被移除时仍无结果的调用（以 "tool#call_id" 记录），视为 unresolved
    #[serde(default)]
    pub unresolved: Vec<String>,
}

/// 单条日志消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolCallResult>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<CompactionSummary>,
}

impl Message {
    fn with_role(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            timestamp: Utc::now(),
            run_id: None,
            summary: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content.into())
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content.into())
    }

    /// 携带本轮计划中工具调用请求的 assistant 消息
    pub fn assistant_calls(content: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, content.into());
        msg.tool_calls = calls;
        msg
    }

    /// 按计划顺序汇总的工具结果消息
    pub fn tool_results(results: Vec<ToolCallResult>) -> Self {
        let content = results
            .iter()
            .map(|r| format!("{} -> {}", r.tool, r.outcome.render()))
            .collect::<Vec<_>>()
            .join("\n");
        let mut msg = Self::with_role(Role::Tool, content);
        msg.tool_results = results;
        msg
    }

    /// 压缩生成的摘要条目
    pub fn compaction_summary(content: impl Into<String>, summary: CompactionSummary) -> Self {
        let mut msg = Self::with_role(Role::System, content.into());
        msg.summary = Some(summary);
        msg
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn is_summary(&self) -> bool {
        self.summary.is_some()
    }
}

/// 日志中没有配对结果的调用请求 id（按出现顺序）
pub fn dangling_calls(log: &[Message]) -> Vec<String> {
    let resolved: HashSet<&str> = log
        .iter()
        .flat_map(|m| m.tool_results.iter().map(|r| r.call_id.as_str()))
        .collect();
    log.iter()
        .flat_map(|m| m.tool_calls.iter())
        .filter(|c| !resolved.contains(c.id.as_str()))
        .map(|c| c.id.clone())
        .collect()
}

/// 日志中引用了不存在请求的结果 id
pub fn orphaned_results(log: &[Message]) -> Vec<String> {
    let requested: HashSet<&str> = log
        .iter()
        .flat_map(|m| m.tool_calls.iter().map(|c| c.id.as_str()))
        .collect();
    log.iter()
        .flat_map(|m| m.tool_results.iter())
        .filter(|r| !requested.contains(r.call_id.as_str()))
        .map(|r| r.call_id.clone())
        .collect()
}

/// 请求 id -> 请求所在条目下标
pub(crate) fn call_positions(log: &[Message]) -> HashMap<&str, usize> {
    let mut positions = HashMap::new();
    for (idx, msg) in log.iter().enumerate() {
        for call in &msg.tool_calls {
            positions.insert(call.id.as_str(), idx);
        }
    }
    positions
}
