//! MemoryManager：会话日志的唯一入口（append / read / compact / seal_dangling）
//!
//! 包装一个 MemoryBackend 与一个 Summarizer；会话主日志使用 `MemoryKey::main(session_id)`。

use std::sync::Arc;

use crate::core::AgentError;
use crate::memory::compactor::{build_summary_entry, plan_compaction};
use crate::memory::{
    dangling_calls, CompactionPolicy, LongTermBackend, MemoryBackend, MemoryError, MemoryKey, MemoryRecord,
    Message, ReadRange, Summarizer, TokenEstimator, ToolCallResult,
};

/// 一次压缩的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub replaced: usize,
    pub unresolved: Vec<String>,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

#[derive(Clone)]
pub struct MemoryManager {
    backend: Arc<dyn MemoryBackend>,
    summarizer: Arc<dyn Summarizer>,
    /// 跨会话的用户资料；未配置 long-term 后端时为 None
    facts: Option<Arc<LongTermBackend>>,
}

impl MemoryManager {
    pub fn new(backend: Arc<dyn MemoryBackend>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            backend,
            summarizer,
            facts: None,
        }
    }

    pub fn with_facts(mut self, store: Arc<LongTermBackend>) -> Self {
        self.facts = Some(store);
        self
    }

    pub fn has_fact_store(&self) -> bool {
        self.facts.is_some()
    }

    /// 某用户已记住的资料；没有资料库时为空
    pub async fn recall_facts(&self, subject: &str) -> Result<Vec<(String, String)>, MemoryError> {
        match &self.facts {
            Some(store) => store.recall_facts(subject).await,
            None => Ok(Vec::new()),
        }
    }

    /// 写入用户资料（同键覆盖）；没有资料库时忽略
    pub async fn remember_facts(&self, subject: &str, facts: &[(String, String)]) -> Result<(), MemoryError> {
        let Some(store) = &self.facts else {
            return Ok(());
        };
        for (key, value) in facts {
            store.remember_fact(subject, key, value).await?;
        }
        if !facts.is_empty() {
            tracing::debug!(subject = %subject, count = facts.len(), "user facts remembered");
        }
        Ok(())
    }

    pub fn backend(&self) -> &Arc<dyn MemoryBackend> {
        &self.backend
    }

    pub async fn append(&self, session_id: &str, entry: &Message) -> Result<usize, MemoryError> {
        self.backend.append(&MemoryKey::main(session_id), entry).await
    }

    pub async fn read(&self, session_id: &str, range: ReadRange) -> Result<Vec<Message>, MemoryError> {
        self.backend.read(&MemoryKey::main(session_id), range).await
    }

    /// 活动窗口的估算 token 数
    pub async fn window_tokens(&self, session_id: &str) -> Result<usize, MemoryError> {
        let log = self.read(session_id, ReadRange::All).await?;
        Ok(TokenEstimator::estimate_window(&log))
    }

    /// 超过阈值时压缩；未压缩返回 None
    pub async fn compact(
        &self,
        session_id: &str,
        policy: &CompactionPolicy,
    ) -> Result<Option<CompactionReport>, AgentError> {
        let key = MemoryKey::main(session_id);
        let log = self.backend.read(&key, ReadRange::All).await?;
        let tokens_before = TokenEstimator::estimate_window(&log);
        if tokens_before <= policy.token_threshold {
            return Ok(None);
        }
        let Some(plan) = plan_compaction(&log, policy.keep_last_k) else {
            return Ok(None);
        };

        let summary = build_summary_entry(self.summarizer.as_ref(), &log, &plan).await?;
        self.backend
            .replace_range(&key, plan.range.clone(), &summary)
            .await?;

        let tokens_after = self.window_tokens(session_id).await?;
        tracing::info!(
            session = %session_id,
            replaced = plan.range.len(),
            tokens_before,
            tokens_after,
            "context compacted"
        );
        Ok(Some(CompactionReport {
            replaced: plan.range.len(),
            unresolved: plan.unresolved,
            tokens_before,
            tokens_after,
        }))
    }

    /// 为日志中所有悬空请求追加 unresolved 结果，返回被封闭的请求 id
    pub async fn seal_dangling(&self, session_id: &str, reason: &str) -> Result<Vec<String>, MemoryError> {
        let log = self.read(session_id, ReadRange::All).await?;
        let dangling = dangling_calls(&log);
        if dangling.is_empty() {
            return Ok(dangling);
        }
        let results: Vec<ToolCallResult> = log
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .filter(|c| dangling.contains(&c.id))
            .map(|c| ToolCallResult::unresolved(c, reason))
            .collect();
        self.append(session_id, &Message::tool_results(results)).await?;
        tracing::warn!(session = %session_id, count = dangling.len(), "sealed dangling tool calls");
        Ok(dangling)
    }

    /// 会话主日志的完整记录
    pub async fn record(&self, session_id: &str) -> Result<MemoryRecord, MemoryError> {
        let key = MemoryKey::main(session_id);
        let entries = self.backend.read(&key, ReadRange::All).await?;
        Ok(MemoryRecord {
            key,
            entries,
            backend: self.backend.tag(),
        })
    }
}
