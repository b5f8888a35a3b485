//! Context Compaction：token 超阈值时把最早的一段连续条目替换为一条摘要
//!
//! 规则：
//! - 最近 `keep_last_k` 条原样保留；
//! - 分割点向前移动，直到保留区内的每个工具结果都能在保留区找到它的请求（不拆散调用/结果对）；
//! - 被移除区间里没有任何结果的请求记为 unresolved，写进摘要条目的元数据；
//! - 若可移除的只有一条既有摘要，则不做任何事（幂等）。

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::conversation::call_positions;
use crate::memory::{CompactionSummary, Message, Role, TokenEstimator};

/// 压缩策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    /// 活动窗口估算 token 超过此值时触发
    pub token_threshold: usize,
    /// 始终原样保留的最近条目数
    pub keep_last_k: usize,
}

impl CompactionPolicy {
    pub fn new(token_threshold: usize, keep_last_k: usize) -> Self {
        Self {
            token_threshold,
            keep_last_k,
        }
    }

    /// 忽略阈值的同一策略（恢复引擎 SummarizeAndPrune 使用）
    pub fn forced(self) -> Self {
        Self {
            token_threshold: 0,
            ..self
        }
    }

    pub fn should_compact(&self, window: &[Message]) -> bool {
        TokenEstimator::estimate_window(window) > self.token_threshold
    }
}

/// 一次压缩要替换的区间与其中的 unresolved 调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionPlan {
    pub range: Range<usize>,
    /// "tool#call_id"
    pub unresolved: Vec<String>,
}

/// 计算分割点；不需要压缩时返回 None
pub fn plan_compaction(log: &[Message], keep_last_k: usize) -> Option<CompactionPlan> {
    if log.len() <= keep_last_k {
        return None;
    }
    let positions = call_positions(log);
    let mut boundary = log.len() - keep_last_k;

    // 保留区里的结果若引用了被移除区的请求，分割点前移到该请求处，直到稳定
    loop {
        let earliest = log[boundary..]
            .iter()
            .flat_map(|m| m.tool_results.iter())
            .filter_map(|r| positions.get(r.call_id.as_str()).copied())
            .filter(|&pos| pos < boundary)
            .min();
        match earliest {
            Some(pos) => boundary = pos,
            None => break,
        }
    }

    if boundary == 0 || (boundary == 1 && log[0].is_summary()) {
        return None;
    }

    let prefix = &log[..boundary];
    let resolved: HashSet<&str> = prefix
        .iter()
        .flat_map(|m| m.tool_results.iter().map(|r| r.call_id.as_str()))
        .collect();

    let mut unresolved: Vec<String> = prefix
        .iter()
        .filter_map(|m| m.summary.as_ref())
        .flat_map(|s| s.unresolved.iter().cloned())
        .collect();
    unresolved.extend(
        prefix
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .filter(|c| !resolved.contains(c.id.as_str()))
            .map(|c| format!("{}#{}", c.tool, c.id)),
    );

    Some(CompactionPlan {
        range: 0..boundary,
        unresolved,
    })
}

/// 由一段条目生成摘要文本
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, entries: &[Message]) -> Result<String, AgentError>;
}

/// 抽取式摘要：确定性，不调用模型
pub struct ExtractiveSummarizer {
    max_line_chars: usize,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self { max_line_chars: 160 }
    }
}

impl ExtractiveSummarizer {
    pub fn new(max_line_chars: usize) -> Self {
        Self {
            max_line_chars: max_line_chars.max(16),
        }
    }

    fn line(&self, msg: &Message) -> Option<String> {
        let text = msg.content.trim();
        if text.is_empty() && msg.tool_calls.is_empty() {
            return None;
        }
        let label = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "note",
        };
        let body = if text.is_empty() {
            let names: Vec<&str> = msg.tool_calls.iter().map(|c| c.tool.as_str()).collect();
            format!("called {}", names.join(", "))
        } else {
            text.replace('\n', " ")
        };
        let clipped: String = body.chars().take(self.max_line_chars).collect();
        let ellipsis = if body.chars().count() > self.max_line_chars { "..." } else { "" };
        Some(format!("- {}: {}{}", label, clipped, ellipsis))
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, entries: &[Message]) -> Result<String, AgentError> {
        let mut lines = Vec::with_capacity(entries.len() + 1);
        lines.push(format!("Summary of {} earlier entries:", entries.len()));
        for msg in entries {
            if msg.is_summary() {
                lines.push(format!("- earlier: {}", msg.content.replace('\n', " ")));
            } else if let Some(line) = self.line(msg) {
                lines.push(line);
            }
        }
        Ok(lines.join("\n"))
    }
}

/// 调用模型生成摘要
pub struct ModelSummarizer {
    llm: Arc<dyn LlmClient>,
}

impl ModelSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Summarizer for ModelSummarizer {
    async fn summarize(&self, entries: &[Message]) -> Result<String, AgentError> {
        let transcript = entries
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = vec![
            Message::system(
                "Summarize the conversation below in a few sentences. Keep product names, SKUs, \
                 prices, user preferences and any open requests. Output plain text only.",
            ),
            Message::user(transcript),
        ];
        let reply = self
            .llm
            .complete(&prompt, &[])
            .await
            .map_err(|e| AgentError::ModelError(e.to_string()))?;
        Ok(reply.content.trim().to_string())
    }
}

/// 根据计划生成摘要条目
pub async fn build_summary_entry(
    summarizer: &dyn Summarizer,
    log: &[Message],
    plan: &CompactionPlan,
) -> Result<Message, AgentError> {
    let replaced = &log[plan.range.clone()];
    let mut content = summarizer.summarize(replaced).await?;
    if !plan.unresolved.is_empty() {
        content.push_str(&format!("\nUnresolved calls: {}", plan.unresolved.join(", ")));
    }
    Ok(Message::compaction_summary(
        content,
        CompactionSummary {
            replaced: replaced.len(),
            unresolved: plan.unresolved.clone(),
        },
    ))
}
