//! Run / Trace / Thread / Feedback 记录
//!
//! Run：一次模型、工具、护栏、审批或子智能体调用；Trace：一轮内按顺序的 Run；
//! Thread：一个会话按顺序的 Trace。创建后只追加，唯一允许的后续修改是附加 feedback / tag。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::ReasonCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Model,
    Tool,
    Guardrail,
    Approval,
    Subagent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failure { code: ReasonCode, message: String },
    /// 被拦截或跳过（未接触后端）
    Skipped { code: ReasonCode, message: String },
}

impl RunOutcome {
    pub fn code(&self) -> Option<ReasonCode> {
        match self {
            RunOutcome::Success => None,
            RunOutcome::Failure { code, .. } | RunOutcome::Skipped { code, .. } => Some(*code),
        }
    }
}

/// 单条护栏检查结论
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictRecord {
    pub check: String,
    pub phase: String,
    /// allow / redact / block
    pub verdict: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FeedbackValue {
    Score(f64),
    Tag(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub run_id: Uuid,
    pub value: FeedbackValue,
    pub created_at: DateTime<Utc>,
}

impl Feedback {
    pub fn score(run_id: Uuid, score: f64) -> Self {
        Self {
            run_id,
            value: FeedbackValue::Score(score),
            created_at: Utc::now(),
        }
    }

    pub fn tag(run_id: Uuid, tag: impl Into<String>) -> Self {
        Self {
            run_id,
            value: FeedbackValue::Tag(tag.into()),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub trace_id: Uuid,
    pub thread_id: String,
    pub kind: RunKind,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verdicts: Vec<VerdictRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feedback: Vec<Feedback>,
    #[serde(default)]
    pub metadata: Value,
}

impl Run {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Success)
    }
}

/// 构造中的 Run；started_at 在 start 时记录
#[derive(Debug, Clone)]
pub struct RunBuilder {
    id: Uuid,
    kind: RunKind,
    name: String,
    started_at: DateTime<Utc>,
    verdicts: Vec<VerdictRecord>,
    tags: Vec<String>,
    metadata: Value,
}

impl RunBuilder {
    pub fn start(kind: RunKind, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            name: name.into(),
            started_at: Utc::now(),
            verdicts: Vec::new(),
            tags: Vec::new(),
            metadata: Value::Null,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn verdicts(mut self, verdicts: Vec<VerdictRecord>) -> Self {
        self.verdicts = verdicts;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn finish(self, trace_id: Uuid, thread_id: &str, outcome: RunOutcome) -> Run {
        Run {
            id: self.id,
            trace_id,
            thread_id: thread_id.to_string(),
            kind: self.kind,
            name: self.name,
            started_at: self.started_at,
            finished_at: Utc::now(),
            outcome,
            verdicts: self.verdicts,
            tags: self.tags,
            feedback: Vec::new(),
            metadata: self.metadata,
        }
    }
}

/// 一轮内的 Run 序列
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub id: Uuid,
    pub thread_id: String,
    pub runs: Vec<Run>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// 本轮最终状态（done / failed）
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReasonCode>,
}

/// 一个会话的 Trace 序列
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub traces: Vec<Trace>,
}
