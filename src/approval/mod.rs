//! 人工审批（Human-in-the-loop）
//!
//! ApprovalGate 为危险工具调用创建 ApprovalRequest，并挂起发起它的那一个步骤（其他步骤与会话照常运行），
//! 直到以下之一发生：
//! - 外部操作员通过 `resolve` 给出 approve / deny；
//! - `auto` 模式下请求属于良性类别，立即放行（actor = `policy:auto`）；
//! - 超时 → `timed_out`，与 `denied` 同等对待；
//! - 会话取消 → `cancelled`。
//!
//! 结果总是一个终态 ApprovalOutcome，从不以错误形式抛出。
//! 挂起表与审计日志共用一把锁；审计日志有容量上限，超出时丢弃最旧的终态记录。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 自动策略的 actor 名
pub const AUTO_POLICY_ACTOR: &str = "policy:auto";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    Auto,
    #[default]
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    TimedOut,
    Cancelled,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

/// 待审批的操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub session_id: String,
    pub tool: String,
    pub operation_summary: String,
    pub risk_category: String,
    pub args: Value,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn new(
        session_id: impl Into<String>,
        tool: impl Into<String>,
        risk_category: impl Into<String>,
        args: Value,
    ) -> Self {
        let tool = tool.into();
        let operation_summary = format!("{} {}", tool, args);
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            tool,
            operation_summary,
            risk_category: risk_category.into(),
            args,
            created_at: Utc::now(),
        }
    }
}

/// 操作员的答复
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub id: Uuid,
    pub decision: ApprovalDecision,
    pub actor: String,
    #[serde(default)]
    pub note: Option<String>,
}

impl ApprovalResponse {
    pub fn approve(id: Uuid, actor: impl Into<String>) -> Self {
        Self {
            id,
            decision: ApprovalDecision::Approve,
            actor: actor.into(),
            note: None,
        }
    }

    pub fn deny(id: Uuid, actor: impl Into<String>, note: Option<String>) -> Self {
        Self {
            id,
            decision: ApprovalDecision::Deny,
            actor: actor.into(),
            note,
        }
    }
}

/// 一个请求的终态结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    pub request_id: Uuid,
    pub status: ApprovalStatus,
    pub actor: Option<String>,
    pub note: Option<String>,
}

/// 审计记录：每个请求一条，终态写回
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub request: ApprovalRequest,
    pub status: ApprovalStatus,
    pub actor: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApprovalError {
    #[error("Unknown approval request: {0}")]
    UnknownRequest(Uuid),

    #[error("Approval request already resolved: {0}")]
    AlreadyResolved(Uuid),

    #[error("Approval channel closed")]
    ChannelClosed,
}

/// 把请求送达操作员；答复经 ApprovalGate::resolve 回来
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    async fn notify(&self, request: &ApprovalRequest) -> Result<(), ApprovalError>;
}

/// 只记日志的通道（无人值守时请求只能超时）
#[derive(Debug, Default)]
pub struct LogOnlyChannel;

#[async_trait]
impl ApprovalChannel for LogOnlyChannel {
    async fn notify(&self, request: &ApprovalRequest) -> Result<(), ApprovalError> {
        tracing::info!(
            approval_id = %request.id,
            tool = %request.tool,
            category = %request.risk_category,
            "approval requested"
        );
        Ok(())
    }
}

/// 通过 mpsc 把请求交给外部操作员（交互界面、测试）
#[derive(Debug, Clone)]
pub struct ChannelOperator {
    tx: mpsc::UnboundedSender<ApprovalRequest>,
}

impl ChannelOperator {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ApprovalRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ApprovalChannel for ChannelOperator {
    async fn notify(&self, request: &ApprovalRequest) -> Result<(), ApprovalError> {
        self.tx
            .send(request.clone())
            .map_err(|_| ApprovalError::ChannelClosed)
    }
}

/// 审计日志默认保留条数
pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

struct PendingEntry {
    request: ApprovalRequest,
    tx: oneshot::Sender<ApprovalResponse>,
}

/// 挂起表与审计日志在同一把锁下更新
struct GateState {
    pending: HashMap<Uuid, PendingEntry>,
    audit: VecDeque<ApprovalRecord>,
    audit_capacity: usize,
}

impl GateState {
    fn push_record(&mut self, record: ApprovalRecord) {
        self.audit.push_back(record);
        self.prune();
    }

    /// 超出容量时从最旧的终态记录开始丢弃；挂起中的记录保留
    fn prune(&mut self) {
        while self.audit.len() > self.audit_capacity {
            match self.audit.iter().position(|r| r.status.is_terminal()) {
                Some(idx) => {
                    self.audit.remove(idx);
                }
                None => break,
            }
        }
    }
}

/// 审批门
pub struct ApprovalGate {
    mode: ApprovalMode,
    timeout: Duration,
    auto_categories: HashSet<String>,
    channel: Arc<dyn ApprovalChannel>,
    state: Mutex<GateState>,
}

fn settled(id: Uuid, status: ApprovalStatus) -> ApprovalOutcome {
    ApprovalOutcome {
        request_id: id,
        status,
        actor: None,
        note: None,
    }
}

fn answered(resp: ApprovalResponse) -> ApprovalOutcome {
    ApprovalOutcome {
        request_id: resp.id,
        status: match resp.decision {
            ApprovalDecision::Approve => ApprovalStatus::Approved,
            ApprovalDecision::Deny => ApprovalStatus::Denied,
        },
        actor: Some(resp.actor),
        note: resp.note,
    }
}

impl ApprovalGate {
    pub fn new(
        mode: ApprovalMode,
        timeout: Duration,
        auto_categories: impl IntoIterator<Item = String>,
        channel: Arc<dyn ApprovalChannel>,
    ) -> Self {
        Self {
            mode,
            timeout,
            auto_categories: auto_categories.into_iter().collect(),
            channel,
            state: Mutex::new(GateState {
                pending: HashMap::new(),
                audit: VecDeque::new(),
                audit_capacity: DEFAULT_AUDIT_CAPACITY,
            }),
        }
    }

    /// 审计日志最多保留的条数（至少 1）
    pub fn with_audit_capacity(self, capacity: usize) -> Self {
        self.lock().audit_capacity = capacity.max(1);
        self
    }

    pub fn mode(&self) -> ApprovalMode {
        self.mode
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 提交请求并等待终态
    pub async fn request(&self, request: ApprovalRequest, cancel: &CancellationToken) -> ApprovalOutcome {
        let id = request.id;
        let record = ApprovalRecord {
            request: request.clone(),
            status: ApprovalStatus::Pending,
            actor: None,
            resolved_at: None,
        };

        if self.mode == ApprovalMode::Auto && self.auto_categories.contains(&request.risk_category) {
            self.lock().push_record(record);
            let outcome = ApprovalOutcome {
                request_id: id,
                status: ApprovalStatus::Approved,
                actor: Some(AUTO_POLICY_ACTOR.to_string()),
                note: None,
            };
            self.finish(&outcome);
            return outcome;
        }

        let (tx, mut rx) = oneshot::channel();
        {
            let mut state = self.lock();
            state.pending.insert(
                id,
                PendingEntry {
                    request: request.clone(),
                    tx,
                },
            );
            state.push_record(record);
        }

        if let Err(e) = self.channel.notify(&request).await {
            tracing::warn!(approval_id = %id, error = %e, "approval channel failed, waiting for timeout");
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => self.abandon(id, ApprovalStatus::Cancelled, &mut rx),
            _ = tokio::time::sleep(self.timeout) => self.abandon(id, ApprovalStatus::TimedOut, &mut rx),
            resp = &mut rx => match resp {
                Ok(resp) => answered(resp),
                Err(_) => settled(id, ApprovalStatus::Cancelled),
            },
        };

        self.finish(&outcome);
        outcome
    }

    /// 超时或取消时撤回挂起项；若答复已先一步送达则以答复为准
    fn abandon(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        rx: &mut oneshot::Receiver<ApprovalResponse>,
    ) -> ApprovalOutcome {
        let withdrawn = self.lock().pending.remove(&id).is_some();
        if withdrawn {
            return settled(id, status);
        }
        match rx.try_recv() {
            Ok(resp) => answered(resp),
            Err(_) => settled(id, status),
        }
    }

    /// 外部操作员的答复；未知或已终结的 id 返回错误
    pub fn resolve(&self, response: ApprovalResponse) -> Result<(), ApprovalError> {
        let id = response.id;
        let mut state = self.lock();
        match state.pending.remove(&id) {
            Some(entry) => entry.tx.send(response).map_err(|_| ApprovalError::AlreadyResolved(id)),
            None if state.audit.iter().any(|r| r.request.id == id) => Err(ApprovalError::AlreadyResolved(id)),
            None => Err(ApprovalError::UnknownRequest(id)),
        }
    }

    /// 当前挂起的请求（按创建时间）
    pub fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<ApprovalRequest> = self.lock().pending.values().map(|e| e.request.clone()).collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    pub fn audit_log(&self) -> Vec<ApprovalRecord> {
        self.lock().audit.iter().cloned().collect()
    }

    fn finish(&self, outcome: &ApprovalOutcome) {
        {
            let mut state = self.lock();
            if let Some(record) = state.audit.iter_mut().find(|r| r.request.id == outcome.request_id) {
                record.status = outcome.status;
                record.actor = outcome.actor.clone();
                record.resolved_at = Some(Utc::now());
            }
            state.prune();
        }
        tracing::info!(
            approval_id = %outcome.request_id,
            status = ?outcome.status,
            actor = outcome.actor.as_deref().unwrap_or("-"),
            "approval settled"
        );
    }
}
