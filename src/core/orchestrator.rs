//! 会话编排器：主控循环
//!
//! Orchestrator 独占一个 Session，逐轮驱动 run_turn。spawn_session 在后台任务中消费命令
//! （Submit / Cancel / Close），并通过 watch 通道发布 SessionSnapshot。
//! 轮次进行中收到的 Submit 排队，Cancel 立即触发当前轮次的取消令牌。

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentRuntime, ReasonCode, Session, SessionSnapshot, SessionSupervisor};
use crate::memory::{MemoryRecord, Message};
use crate::observability::Recorder;
use crate::react::{run_turn, TurnOptions, TurnOutcome};

/// 发往会话任务的命令
#[derive(Debug)]
pub enum Command {
    /// 提交用户输入；轮次结束后通过 reply 返回结果
    Submit {
        input: String,
        reply: oneshot::Sender<TurnOutcome>,
    },
    /// 取消进行中的轮次
    Cancel,
    /// 关闭会话
    Close,
}

pub struct Orchestrator {
    runtime: Arc<AgentRuntime>,
    session: Session,
    recorder: Recorder,
    supervisor: SessionSupervisor,
    options: TurnOptions,
    last_reason: Option<ReasonCode>,
}

impl Orchestrator {
    pub fn new(runtime: Arc<AgentRuntime>, session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        let cfg = runtime.config();
        let session = Session::new(session_id.clone(), cfg.orchestrator.session_token_budget);
        let mut options = TurnOptions::from_config(cfg);
        options.fact_subject = Some(session_id.clone());
        let recorder = Recorder::new(runtime.sink().clone(), session_id);
        Self {
            runtime,
            session,
            recorder,
            supervisor: SessionSupervisor::new(),
            options,
            last_reason: None,
        }
    }

    pub fn with_options(mut self, options: TurnOptions) -> Self {
        self.options = options;
        self
    }

    /// 以用户 id 作为长期资料的主体，同一用户的不同会话共享资料
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.options.fact_subject = Some(user_id.into());
        self
    }

    pub fn runtime(&self) -> &Arc<AgentRuntime> {
        &self.runtime
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// 当前轮次的取消令牌；被取消的轮次结束后换发新令牌
    pub fn cancel_token(&self) -> CancellationToken {
        self.supervisor.cancel_token()
    }

    pub fn cancel(&self) {
        self.supervisor.cancel();
    }

    /// 运行一轮
    pub async fn submit(&mut self, input: &str) -> TurnOutcome {
        let cancel = self.supervisor.cancel_token();
        let outcome = run_turn(
            &self.runtime,
            &mut self.session,
            &self.options,
            input,
            &cancel,
            &self.recorder,
        )
        .await;
        self.last_reason = outcome.reason;
        if self.supervisor.reset_if_cancelled() {
            tracing::debug!(session = %self.session.id(), "cancel token renewed");
        }
        outcome
    }

    pub fn snapshot(&self, busy: bool) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session.id().to_string(),
            state: self.session.state(),
            turns: self.session.turns(),
            busy,
            token_budget_remaining: self.session.token_budget_remaining(),
            usage: self.session.usage(),
            active_subagents: self.session.active_subagents().len(),
            last_reason: self.last_reason,
            closed: self.session.is_closed(),
        }
    }

    /// 会话主日志的记录（键、压缩后的窗口、后端标签）
    pub async fn record(&self) -> Result<MemoryRecord, crate::core::AgentError> {
        Ok(self.runtime.memory().record(self.session.id()).await?)
    }

    /// 会话日志（压缩后的窗口）
    pub async fn history(&self) -> Result<Vec<Message>, crate::core::AgentError> {
        Ok(self.record().await?.entries)
    }

    /// 关闭会话：取消在途工作，补齐悬空调用，此后的 submit 均以 session_closed 失败
    pub async fn close(&mut self) {
        if self.session.is_closed() {
            return;
        }
        self.supervisor.cancel();
        match self.runtime.memory().seal_dangling(self.session.id(), "session closed").await {
            Ok(sealed) if !sealed.is_empty() => {
                tracing::info!(session = %self.session.id(), sealed = sealed.len(), "sealed dangling calls on close")
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(session = %self.session.id(), error = %e, "failed to seal dangling calls on close"),
        }
        self.session.close();
        tracing::info!(session = %self.session.id(), "session closed");
    }
}

/// 在后台任务中运行一个会话：返回命令发送端、快照接收端与任务句柄
pub fn spawn_session(
    runtime: Arc<AgentRuntime>,
    session_id: impl Into<String>,
) -> (
    mpsc::UnboundedSender<Command>,
    watch::Receiver<SessionSnapshot>,
    JoinHandle<()>,
) {
    let mut orchestrator = Orchestrator::new(runtime, session_id);
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (state_tx, state_rx) = watch::channel(orchestrator.snapshot(false));

    let handle = tokio::spawn(async move {
        let mut queued: VecDeque<Command> = VecDeque::new();
        let mut closing = false;

        loop {
            let next = match queued.pop_front() {
                Some(cmd) => Some(cmd),
                None if closing => None,
                None => cmd_rx.recv().await,
            };
            let Some(cmd) = next else { break };

            match cmd {
                Command::Submit { input, reply } => {
                    let _ = state_tx.send(orchestrator.snapshot(true));
                    let cancel = orchestrator.cancel_token();
                    let outcome = {
                        let turn = orchestrator.submit(&input);
                        tokio::pin!(turn);
                        loop {
                            tokio::select! {
                                outcome = &mut turn => break outcome,
                                Some(cmd) = cmd_rx.recv() => match cmd {
                                    Command::Cancel => cancel.cancel(),
                                    Command::Close => {
                                        cancel.cancel();
                                        closing = true;
                                    }
                                    submit => queued.push_back(submit),
                                },
                            }
                        }
                    };
                    let _ = reply.send(outcome);
                    if closing {
                        orchestrator.close().await;
                    }
                    let _ = state_tx.send(orchestrator.snapshot(false));
                }
                Command::Cancel => {
                    tracing::debug!(session = %orchestrator.session().id(), "cancel with no turn in flight");
                }
                Command::Close => {
                    closing = true;
                    orchestrator.close().await;
                    let _ = state_tx.send(orchestrator.snapshot(false));
                }
            }
        }
    });

    (cmd_tx, state_rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::{RuntimeBuilder, SessionState};
    use crate::llm::{ModelReply, ScriptedLlmClient};
    use std::time::Duration;

    async fn runtime(llm: Arc<ScriptedLlmClient>) -> Arc<AgentRuntime> {
        RuntimeBuilder::new(AppConfig::default()).llm(llm).build().await.unwrap()
    }

    #[tokio::test]
    async fn test_submit_direct_answer() {
        let llm = Arc::new(ScriptedLlmClient::with_replies([ModelReply::text("Hello!").with_usage(10, 5)]));
        let rt = runtime(llm).await;
        let mut orch = rt.orchestrator("s1");
        let out = orch.submit("hi").await;
        assert!(out.is_done());
        assert_eq!(out.response, "Hello!");
        assert_eq!(
            out.states,
            vec![
                SessionState::Planning,
                SessionState::Verifying,
                SessionState::Responding,
                SessionState::Done
            ]
        );
        let snap = orch.snapshot(false);
        assert_eq!(snap.turns, 1);
        assert_eq!(snap.usage.total(), 15);
        let record = orch.record().await.unwrap();
        assert_eq!(record.entries.len(), 2);
        assert_eq!(record.backend, crate::memory::BackendTag::Ephemeral);
        assert_eq!(record.key, crate::memory::MemoryKey::main("s1"));
    }

    #[tokio::test]
    async fn test_closed_session_rejects_turns() {
        let llm = Arc::new(ScriptedLlmClient::new());
        let rt = runtime(llm).await;
        let mut orch = rt.orchestrator("s2");
        orch.close().await;
        let out = orch.submit("hi").await;
        assert_eq!(out.reason, Some(ReasonCode::SessionClosed));
        assert!(orch.snapshot(false).closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_session_cancel_then_continue() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_delayed(ModelReply::text("too late"), Duration::from_secs(30));
        llm.push_reply(ModelReply::text("second answer"));
        let rt = runtime(llm.clone()).await;
        let (tx, mut state_rx, handle) = spawn_session(rt, "s3");

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Command::Submit {
            input: "first".into(),
            reply: reply_tx,
        })
        .unwrap();
        state_rx.changed().await.unwrap();
        assert!(state_rx.borrow().busy);
        while llm.calls() == 0 {
            tokio::task::yield_now().await;
        }
        tx.send(Command::Cancel).unwrap();
        let first = reply_rx.await.unwrap();
        assert_eq!(first.reason, Some(ReasonCode::Cancelled));

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Command::Submit {
            input: "second".into(),
            reply: reply_tx,
        })
        .unwrap();
        let second = reply_rx.await.unwrap();
        assert!(second.is_done());
        assert_eq!(second.response, "second answer");

        tx.send(Command::Close).unwrap();
        handle.await.unwrap();
        assert!(state_rx.borrow().closed);
    }
}
