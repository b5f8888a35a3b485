//! Planner：调用模型并把回复解析为 Plan
//!
//! 结构化 tool_calls 优先；否则从文本中提取 JSON（```json 块或以 `{` 开头的正文），支持三种形态：
//! - `{"tool": "...", "args": {...}, "specialist": "..."}`
//! - `{"calls": [ ... ], "response": "..."}`
//! - `{"response": "..."}`
//!
//! 纯文本视为直接回答；JSON 无法解析时返回 JsonParseError，由恢复引擎注入纠正提示。

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::core::AgentError;
use crate::llm::{LlmClient, ModelReply, ToolDescriptor};
use crate::memory::{Message, ToolCallRequest};

/// 委派步骤使用的工具名
pub const DELEGATE_TOOL: &str = "delegate";

#[derive(Debug, Clone, PartialEq)]
pub enum PlanStep {
    Tool(ToolCallRequest),
    Respond { content: String },
}

/// 模型为一轮产出的有序步骤
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn answer(content: impl Into<String>) -> Self {
        Self {
            steps: vec![PlanStep::Respond {
                content: content.into(),
            }],
        }
    }

    pub fn tool_calls(&self) -> Vec<ToolCallRequest> {
        self.steps
            .iter()
            .filter_map(|s| match s {
                PlanStep::Tool(call) => Some(call.clone()),
                PlanStep::Respond { .. } => None,
            })
            .collect()
    }

    /// 没有工具步骤时的直接回答
    pub fn direct_answer(&self) -> Option<&str> {
        if self.steps.iter().any(|s| matches!(s, PlanStep::Tool(_))) {
            return None;
        }
        self.steps.iter().rev().find_map(|s| match s {
            PlanStep::Respond { content } => Some(content.as_str()),
            PlanStep::Tool(_) => None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    specialist: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    calls: Vec<RawCall>,
    #[serde(default)]
    response: Option<String>,
}

/// 从文本中截取 JSON；不像 JSON 的文本返回 None
fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    if trimmed.starts_with('{') {
        let end = trimmed.rfind('}').map(|i| i + 1).unwrap_or(trimmed.len());
        return Some(&trimmed[..end]);
    }
    None
}

fn to_request(raw: RawCall, id: String) -> Result<ToolCallRequest, AgentError> {
    let tool = match (raw.tool, &raw.specialist) {
        (Some(t), _) if !t.trim().is_empty() => t,
        (_, Some(_)) => DELEGATE_TOOL.to_string(),
        _ => return Err(AgentError::JsonParseError("tool call without a tool name".to_string())),
    };
    Ok(ToolCallRequest {
        id: raw.id.filter(|s| !s.is_empty()).unwrap_or(id),
        tool,
        args: raw.args,
        specialist: raw.specialist,
    })
}

/// 解析模型回复；`id_prefix` 用于为文本中的调用生成确定性的 id
pub fn parse_reply(reply: &ModelReply, id_prefix: &str) -> Result<Plan, AgentError> {
    if !reply.tool_calls.is_empty() {
        let steps = reply
            .tool_calls
            .iter()
            .enumerate()
            .map(|(i, call)| {
                let mut call = call.clone();
                if call.id.is_empty() {
                    call.id = format!("{}-{}", id_prefix, i);
                }
                if call.specialist.is_some() && call.tool.is_empty() {
                    call.tool = DELEGATE_TOOL.to_string();
                }
                PlanStep::Tool(call)
            })
            .collect();
        return Ok(Plan { steps });
    }

    let Some(json_str) = extract_json(&reply.content) else {
        return Ok(Plan::answer(reply.content.trim()));
    };
    let value: Value =
        serde_json::from_str(json_str).map_err(|e| AgentError::JsonParseError(format!("{}: {}", e, json_str)))?;

    let is_single_call = value.get("tool").is_some() || value.get("specialist").is_some();
    let raw_plan = if is_single_call {
        let call: RawCall =
            serde_json::from_value(value).map_err(|e| AgentError::JsonParseError(e.to_string()))?;
        RawPlan {
            calls: vec![call],
            response: None,
        }
    } else {
        serde_json::from_value(value).map_err(|e| AgentError::JsonParseError(e.to_string()))?
    };

    let mut steps = raw_plan
        .calls
        .into_iter()
        .enumerate()
        .map(|(i, raw)| to_request(raw, format!("{}-{}", id_prefix, i)).map(PlanStep::Tool))
        .collect::<Result<Vec<_>, _>>()?;
    if let Some(content) = raw_plan.response {
        steps.push(PlanStep::Respond { content });
    }
    if steps.is_empty() {
        return Err(AgentError::JsonParseError("plan contains no calls and no response".to_string()));
    }
    Ok(Plan { steps })
}

/// Planner：持有 LLM，拼接指令文本与会话日志后调用模型
pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    pub async fn plan(
        &self,
        instructions: &str,
        log: &[Message],
        tools: &[ToolDescriptor],
    ) -> Result<ModelReply, AgentError> {
        let mut messages = Vec::with_capacity(log.len() + 1);
        messages.push(Message::system(instructions));
        messages.extend_from_slice(log);
        self.llm
            .complete(&messages, tools)
            .await
            .map_err(|e| AgentError::ModelError(e.to_string()))
    }
}
