//! 子智能体委派（Supervisor 模式）
//!
//! 对每个委派步骤：以受限 allowlist 与隔离的记忆段（子会话 id `<parent>/sub-<n>`）创建子会话，
//! 在独立 tokio 任务上运行子编排直到完成、步数上限或失败。
//! - 每个父轮次的子智能体并发数受信号量限制
//! - 子智能体成功：最终答案作为单个工具结果并入父日志
//! - 子智能体失败（含 panic）：父会话收到 `SubagentFailure` 并继续规划，从不中止父会话
//! - 父会话取消时，子会话的取消令牌（父令牌的 child）一并触发

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::{SpecialistConfig, SubagentsSection};
use crate::core::{ReasonCode, ToolFailure};
use crate::memory::{ToolCallRequest, ToolOutcome};
use crate::observability::{Recorder, RunBuilder, RunKind, RunOutcome};

/// 父会话持有的子智能体句柄，子智能体回报后销毁
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentHandle {
    pub child_session_id: String,
    pub specialist: String,
    pub allowed_tools: Vec<String>,
    /// 所服务的父计划步骤（调用 id）
    pub parent_step: String,
    /// 父轮次的规则要求子会话的工具调用也先审批
    pub require_approval: bool,
}

/// 交给子编排执行的任务
#[derive(Debug, Clone)]
pub struct ChildTask {
    pub handle: SubagentHandle,
    pub specialist: SpecialistConfig,
    pub task: String,
    pub max_steps: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChildStatus {
    Completed { answer: String },
    Failed { code: ReasonCode, summary: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChildReport {
    pub child_session_id: String,
    pub status: ChildStatus,
}

/// 运行子会话的能力；返回 'static future 以便在独立任务上运行
pub trait ChildRunner: Send + Sync {
    fn run_child(self: Arc<Self>, task: ChildTask, cancel: CancellationToken) -> BoxFuture<'static, ChildReport>;
}

/// 从委派步骤中取出任务描述
pub fn task_text(call: &ToolCallRequest) -> String {
    match call.args.get("task").and_then(|t| t.as_str()) {
        Some(task) => task.to_string(),
        None if call.args.is_null() => String::new(),
        None => call.args.to_string(),
    }
}

pub struct SubagentDelegator {
    specialists: Vec<SpecialistConfig>,
    max_concurrent: usize,
    default_max_steps: usize,
}

impl SubagentDelegator {
    pub fn new(specialists: Vec<SpecialistConfig>, max_concurrent: usize, default_max_steps: usize) -> Self {
        Self {
            specialists,
            max_concurrent: max_concurrent.max(1),
            default_max_steps: default_max_steps.max(1),
        }
    }

    pub fn from_config(cfg: &SubagentsSection) -> Self {
        Self::new(cfg.specialists.clone(), cfg.max_concurrent_subagents, cfg.max_steps)
    }

    pub fn specialist(&self, name: &str) -> Option<&SpecialistConfig> {
        self.specialists.iter().find(|s| s.name == name)
    }

    pub fn specialists(&self) -> &[SpecialistConfig] {
        &self.specialists
    }

    /// 每个父轮次新建一次
    pub fn turn_permits(&self) -> Arc<Semaphore> {
        Arc::new(Semaphore::new(self.max_concurrent))
    }

    /// 运行一个委派步骤，结果总是一个 ToolOutcome
    pub async fn delegate(
        &self,
        runner: Arc<dyn ChildRunner>,
        handle: SubagentHandle,
        task: String,
        permits: Arc<Semaphore>,
        cancel: &CancellationToken,
        recorder: &Recorder,
    ) -> ToolOutcome {
        let builder = RunBuilder::start(RunKind::Subagent, handle.specialist.clone()).metadata(json!({
            "child_session": handle.child_session_id,
            "parent_step": handle.parent_step,
        }));

        let outcome = self.run(runner, handle, task, permits, cancel).await;

        let run_outcome = match outcome.failure_ref() {
            None => RunOutcome::Success,
            Some(f) => RunOutcome::Failure {
                code: f.code(),
                message: f.to_string(),
            },
        };
        recorder.finish(builder, run_outcome);
        outcome
    }

    async fn run(
        &self,
        runner: Arc<dyn ChildRunner>,
        handle: SubagentHandle,
        task: String,
        permits: Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> ToolOutcome {
        let Some(specialist) = self.specialist(&handle.specialist).cloned() else {
            return ToolOutcome::failure(ToolFailure::Subagent {
                specialist: handle.specialist.clone(),
                summary: "unknown specialist".to_string(),
            });
        };

        let _permit = tokio::select! {
            _ = cancel.cancelled() => return ToolOutcome::failure(ToolFailure::Cancelled),
            permit = permits.acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => {
                    return ToolOutcome::failure(ToolFailure::Subagent {
                        specialist: specialist.name.clone(),
                        summary: "delegation closed".to_string(),
                    })
                }
            },
        };

        let child_id = handle.child_session_id.clone();
        let max_steps = specialist.max_steps.unwrap_or(self.default_max_steps);
        tracing::info!(
            child = %child_id,
            specialist = %specialist.name,
            parent_step = %handle.parent_step,
            "subagent started"
        );

        let child_task = ChildTask {
            handle,
            specialist: specialist.clone(),
            task,
            max_steps,
        };
        let joined = tokio::spawn(runner.run_child(child_task, cancel.child_token())).await;

        if cancel.is_cancelled() {
            return ToolOutcome::failure(ToolFailure::Cancelled);
        }

        let report = match joined {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(child = %child_id, error = %e, "subagent task aborted");
                ChildReport {
                    child_session_id: child_id.clone(),
                    status: ChildStatus::Failed {
                        code: ReasonCode::InternalError,
                        summary: if e.is_panic() {
                            "subagent panicked".to_string()
                        } else {
                            "subagent task was aborted".to_string()
                        },
                    },
                }
            }
        };

        match report.status {
            ChildStatus::Completed { answer } => {
                tracing::info!(child = %child_id, "subagent completed");
                ToolOutcome::success(json!({
                    "specialist": specialist.name,
                    "session": report.child_session_id,
                    "answer": answer,
                }))
            }
            ChildStatus::Failed { code, summary } => {
                tracing::warn!(child = %child_id, code = %code, "subagent failed");
                ToolOutcome::failure(ToolFailure::Subagent {
                    specialist: specialist.name,
                    summary: format!("[{}] {}", code, summary),
                })
            }
        }
    }
}
