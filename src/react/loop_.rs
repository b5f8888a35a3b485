//! 单轮编排循环
//!
//! Planning → Acting → (AwaitingApproval) → (Delegating) → Verifying → … → Responding → Done，
//! Failed 可由任意状态到达。
//!
//! - 每次模型调用前按需压缩上下文；压缩后仍超限则本轮失败
//! - 同一计划内的工具步骤有界并发执行，全部完成后按计划顺序写入一条工具结果消息
//! - 校验失败（post-tool / pre-response 被拦截）注入纠正提示并重新规划，超过重试上限则失败，不返回未校验的答案
//! - 取消时未完成的步骤以 Cancelled 结果落盘，日志中不留悬空调用
//! - 父会话每轮先经规则引擎：意图决定本轮的工具集、审批要求与附加指令
//! - 成功工具调用参数中的用户资料（地址、支付方式等）在轮次完成时写入长期记忆

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{AppConfig, SpecialistConfig};
use crate::core::{
    AgentError, AgentRuntime, ReasonCode, RecoveryAction, Session, SessionState, TaskScheduler, ToolFailure,
};
use crate::guardrails::{BlockedBy, GuardrailInput, GuardrailPhase, REDACTION};
use crate::llm::{ModelReply, TokenUsage, ToolDescriptor};
use crate::memory::{Message, ReadRange, ToolCallRequest, ToolCallResult, ToolOutcome};
use crate::observability::{Recorder, RunBuilder, RunKind, RunOutcome};
use crate::react::planner::parse_reply;
use crate::react::prompt::{build_instructions, PromptContext};
use crate::rules::{Intent, RuleDecision};
use crate::subagent::{task_text, ChildRunner, SubagentHandle};
use crate::tools::InvocationContext;

/// 一轮的运行参数（父会话来自配置，子会话来自专家配置）
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOptions {
    pub system_prompt: String,
    /// None 表示允许全部已注册工具
    pub allowed_tools: Option<Vec<String>>,
    pub max_steps: usize,
    pub allow_delegation: bool,
    /// 本轮每个工具调用都先审批（危险工具总是审批）
    pub require_approval: bool,
    /// 追加到 Policy 段的指令
    pub instructions: Vec<String>,
    /// 是否对输入运行规则引擎
    pub apply_rules: bool,
    /// 用户资料的主体；None 表示不读写长期资料
    pub fact_subject: Option<String>,
}

impl TurnOptions {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            system_prompt: cfg.orchestrator.system_prompt.clone(),
            allowed_tools: None,
            max_steps: cfg.orchestrator.max_steps,
            allow_delegation: true,
            require_approval: false,
            instructions: Vec::new(),
            apply_rules: true,
            fact_subject: None,
        }
    }

    /// 子智能体：受限 allowlist，不可再委派，不再跑规则
    pub fn for_specialist(specialist: &SpecialistConfig, max_steps: usize) -> Self {
        Self {
            system_prompt: specialist.system_prompt.clone(),
            allowed_tools: Some(specialist.tools.clone()),
            max_steps,
            allow_delegation: false,
            require_approval: false,
            instructions: Vec::new(),
            apply_rules: false,
            fact_subject: None,
        }
    }

    /// 合并规则决定：工具集取交集，审批取或，指令累加
    pub fn apply_decision(&mut self, decision: &RuleDecision) {
        self.allowed_tools = match (self.allowed_tools.take(), &decision.allowed_tools) {
            (None, update) => update.clone(),
            (current, None) => current,
            (Some(current), Some(update)) => Some(current.into_iter().filter(|t| update.contains(t)).collect()),
        };
        self.require_approval |= decision.require_approval;
        self.instructions.extend(decision.system_instructions.iter().cloned());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Done,
    Failed,
}

/// 一轮的结果：失败时带稳定原因码与可读说明
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    pub response: String,
    pub reason: Option<ReasonCode>,
    /// 本轮经过的状态序列
    pub states: Vec<SessionState>,
    pub trace_id: Uuid,
    pub usage: TokenUsage,
}

impl TurnOutcome {
    pub fn is_done(&self) -> bool {
        self.status == TurnStatus::Done
    }
}

#[derive(Debug, Clone, PartialEq)]
struct TurnFailure {
    code: ReasonCode,
    message: String,
}

impl TurnFailure {
    fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<AgentError> for TurnFailure {
    fn from(e: AgentError) -> Self {
        Self::new(e.reason_code(), e.to_string())
    }
}

impl From<crate::memory::MemoryError> for TurnFailure {
    fn from(e: crate::memory::MemoryError) -> Self {
        AgentError::from(e).into()
    }
}

/// 已通过 pre-tool 检查、等待执行的步骤
enum PreparedStep {
    Resolved(ToolOutcome),
    Tool(ToolCallRequest),
    Delegate(ToolCallRequest, SubagentHandle),
}

/// 运行一轮；从不 panic，失败总是以 TurnOutcome 返回
pub async fn run_turn(
    rt: &Arc<AgentRuntime>,
    session: &mut Session,
    options: &TurnOptions,
    input: &str,
    cancel: &CancellationToken,
    recorder: &Recorder,
) -> TurnOutcome {
    let trace_id = recorder.begin_trace();
    let start = session.state_history().len();

    if let Err(e) = session.begin_turn() {
        return TurnOutcome {
            status: TurnStatus::Failed,
            response: e.to_string(),
            reason: Some(e.reason_code()),
            states: Vec::new(),
            trace_id,
            usage: TokenUsage::default(),
        };
    }
    let session_id = session.id().to_string();
    tracing::info!(session = %session_id, turn = session.turns(), "turn started");

    let (result, usage) = {
        let mut turn = Turn {
            rt,
            session: &mut *session,
            options: options.clone(),
            cancel,
            recorder,
            steps: 0,
            corrections: 0,
            usage: TokenUsage::default(),
            last_model_run: None,
            intent: None,
            user_facts: Vec::new(),
            learned: Vec::new(),
        };
        let result = turn.drive(input).await;
        (result, turn.usage)
    };

    match result {
        Ok(answer) => {
            recorder.finish_trace(SessionState::Done.as_str(), None);
            tracing::info!(session = %session_id, tokens = usage.total(), "turn done");
            TurnOutcome {
                status: TurnStatus::Done,
                response: answer,
                reason: None,
                states: session.state_history()[start..].to_vec(),
                trace_id,
                usage,
            }
        }
        Err(failure) => {
            if let Err(e) = rt.memory().seal_dangling(&session_id, &failure.message).await {
                tracing::warn!(session = %session_id, error = %e, "failed to seal dangling calls");
            }
            session.fail();
            recorder.finish_trace(SessionState::Failed.as_str(), Some(failure.code));
            tracing::warn!(session = %session_id, code = %failure.code, reason = %failure.message, "turn failed");
            TurnOutcome {
                status: TurnStatus::Failed,
                response: failure.message,
                reason: Some(failure.code),
                states: session.state_history()[start..].to_vec(),
                trace_id,
                usage,
            }
        }
    }
}

struct Turn<'a> {
    rt: &'a Arc<AgentRuntime>,
    session: &'a mut Session,
    /// 已合并本轮规则决定的参数
    options: TurnOptions,
    cancel: &'a CancellationToken,
    recorder: &'a Recorder,
    steps: usize,
    corrections: usize,
    usage: TokenUsage,
    last_model_run: Option<Uuid>,
    intent: Option<Intent>,
    /// 轮次开始时读出的用户资料
    user_facts: Vec<(String, String)>,
    /// 本轮从工具参数中学到、待写回的资料
    learned: Vec<(String, String)>,
}

impl<'a> Turn<'a> {
    async fn drive(&mut self, input: &str) -> Result<String, TurnFailure> {
        self.check_cancel()?;

        let screened = self.rt.guardrails().evaluate_recorded(
            GuardrailInput::new(GuardrailPhase::PreModel, input, self.session.facts()),
            self.recorder,
        );
        if let Some(b) = screened.blocked {
            return Err(TurnFailure::new(
                b.code,
                format!("input rejected by {}: {}", b.check, b.reason),
            ));
        }
        if self.options.apply_rules {
            self.apply_rules(&screened.content)?;
        }
        self.append(&Message::user(screened.content)).await?;
        if let Some(subject) = &self.options.fact_subject {
            self.user_facts = self.rt.memory().recall_facts(subject).await?;
        }

        loop {
            self.steps += 1;
            if self.steps > self.options.max_steps {
                return Err(TurnFailure::new(
                    ReasonCode::StepLimitExceeded,
                    format!("step limit of {} reached without a verified answer", self.options.max_steps),
                ));
            }
            self.check_cancel()?;
            self.ensure_context().await?;
            if self.session.budget_exhausted() {
                return Err(AgentError::TokenBudgetExceeded {
                    estimated: self.session.usage().total() as usize,
                    limit: self.session.token_budget(),
                }
                .into());
            }

            let reply = self.call_model().await?;
            let id_prefix = format!("t{}-s{}", self.session.turns(), self.steps);
            let plan = match parse_reply(&reply, &id_prefix) {
                Ok(plan) => plan,
                Err(e) => match self.rt.recovery().handle(&e) {
                    RecoveryAction::RetryWithPrompt(note) => {
                        tracing::warn!(session = %self.session.id(), error = %e, "unparseable plan, asking model to retry");
                        self.append(&Message::system(note)).await?;
                        self.transition(SessionState::Planning)?;
                        continue;
                    }
                    _ => return Err(e.into()),
                },
            };

            if let Some(answer) = plan.direct_answer() {
                self.transition(SessionState::Verifying)?;
                match self.verify_answer(answer) {
                    Ok(answer) => return self.respond(answer).await,
                    Err(blocked) => {
                        self.correct(blocked).await?;
                        continue;
                    }
                }
            }

            let verification = self.act(&reply.content, plan.tool_calls()).await?;
            self.check_cancel()?;
            match verification {
                Some(blocked) => self.correct(blocked).await?,
                None => self.transition(SessionState::Planning)?,
            }
        }
    }

    /// 分类意图并合并规则决定；不放行时以 policy_blocked 失败
    fn apply_rules(&mut self, task: &str) -> Result<(), TurnFailure> {
        let rules = self.rt.rules();
        if rules.is_empty() {
            return Ok(());
        }
        let eval = rules.evaluate(task);
        let builder = RunBuilder::start(RunKind::Guardrail, format!("rules:{}", eval.intent.name)).metadata(json!({
            "confidence": eval.intent.confidence,
            "matched": eval.matched,
            "require_approval": eval.decision.require_approval,
            "allowed_tools": eval.decision.allowed_tools,
            "notes": eval.decision.notes,
        }));

        if !eval.decision.allow {
            let reason = if eval.decision.notes.is_empty() {
                "request is not allowed".to_string()
            } else {
                eval.decision.notes.join(" ")
            };
            self.recorder.finish(
                builder,
                RunOutcome::Failure {
                    code: ReasonCode::PolicyBlocked,
                    message: reason.clone(),
                },
            );
            return Err(TurnFailure::new(
                ReasonCode::PolicyBlocked,
                format!("request blocked by policy ({}): {}", eval.intent.name, reason),
            ));
        }

        self.recorder.finish(builder, RunOutcome::Success);
        tracing::debug!(
            session = %self.session.id(),
            intent = %eval.intent.name,
            require_approval = eval.decision.require_approval,
            "rules applied"
        );
        self.options.apply_decision(&eval.decision);
        self.intent = Some(eval.intent);
        Ok(())
    }

    fn check_cancel(&self) -> Result<(), TurnFailure> {
        if self.cancel.is_cancelled() {
            Err(AgentError::Cancelled.into())
        } else {
            Ok(())
        }
    }

    fn transition(&mut self, next: SessionState) -> Result<(), TurnFailure> {
        self.session.transition(next).map_err(TurnFailure::from)
    }

    async fn append(&self, message: &Message) -> Result<(), TurnFailure> {
        self.rt.memory().append(self.session.id(), message).await?;
        Ok(())
    }

    /// 超过阈值则压缩；仍超过上下文上限时强制压缩一次，再不行则失败
    async fn ensure_context(&mut self) -> Result<(), TurnFailure> {
        let memory = self.rt.memory();
        let policy = self.rt.config().memory.compaction_policy();
        let limit = self.rt.config().orchestrator.max_context_tokens;
        let id = self.session.id().to_string();

        if let Some(report) = memory.compact(&id, &policy).await? {
            tracing::debug!(session = %id, replaced = report.replaced, "compacted before planning");
        }
        let mut tokens = memory.window_tokens(&id).await?;
        if tokens > limit {
            if let RecoveryAction::SummarizeAndPrune = self.rt.recovery().handle(&AgentError::ContextWindowExceeded) {
                memory.compact(&id, &policy.forced()).await?;
                tokens = memory.window_tokens(&id).await?;
            }
        }
        if tokens > limit {
            return Err(AgentError::TokenBudgetExceeded {
                estimated: tokens,
                limit,
            }
            .into());
        }
        Ok(())
    }

    fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.rt.router().descriptors(self.options.allowed_tools.as_deref())
    }

    async fn call_model(&mut self) -> Result<ModelReply, TurnFailure> {
        let rt = self.rt;
        let cfg = rt.config();
        let descriptors = self.descriptors();
        let dangerous: Vec<String> = descriptors
            .iter()
            .filter(|d| rt.router().is_dangerous(&d.name))
            .map(|d| d.name.clone())
            .collect();
        let specialists: &[SpecialistConfig] = if self.options.allow_delegation {
            rt.delegator().specialists()
        } else {
            &[]
        };
        let instructions = build_instructions(&PromptContext {
            base: &self.options.system_prompt,
            state: self.session.state(),
            step: self.steps,
            max_steps: self.options.max_steps,
            corrections: self.corrections,
            guardrails: &cfg.guardrails,
            approval_mode: cfg.approval.mode,
            tools: &descriptors,
            dangerous: &dangerous,
            specialists,
            intent: self.intent.as_ref(),
            rule_instructions: &self.options.instructions,
            require_approval: self.options.require_approval,
            user_facts: &self.user_facts,
        });
        let log = rt.memory().read(self.session.id(), ReadRange::All).await?;

        let builder = RunBuilder::start(RunKind::Model, "plan").metadata(json!({
            "step": self.steps,
            "messages": log.len() + 1,
            "tools": descriptors.len(),
        }));
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
            r = rt.planner().plan(&instructions, &log, &descriptors) => r,
        };

        match result {
            Ok(reply) => {
                let builder = builder.metadata(json!({
                    "step": self.steps,
                    "prompt_tokens": reply.usage.prompt_tokens,
                    "completion_tokens": reply.usage.completion_tokens,
                }));
                self.last_model_run = Some(self.recorder.finish(builder, RunOutcome::Success));
                self.session.record_usage(reply.usage);
                self.usage.add(reply.usage);
                Ok(reply)
            }
            Err(e) => {
                self.recorder.finish(
                    builder,
                    RunOutcome::Failure {
                        code: e.reason_code(),
                        message: e.to_string(),
                    },
                );
                Err(e.into())
            }
        }
    }

    /// 工具步骤：pre-tool 检查 → 有界并发执行 → post-tool 校验 → 按计划顺序落盘；返回校验失败（若有）
    async fn act(&mut self, content: &str, calls: Vec<ToolCallRequest>) -> Result<Option<BlockedBy>, TurnFailure> {
        let rt = self.rt;
        let recorder = self.recorder;
        let cancel = self.cancel;

        self.transition(SessionState::Acting)?;
        // 落盘的调用与文本只保留脱敏后的参数
        let policy = rt.guardrails().policy();
        let logged: Vec<ToolCallRequest> = calls
            .iter()
            .map(|call| {
                let mut call = call.clone();
                if let Some(args) = policy.redact_value(&call.args) {
                    call.args = args;
                }
                call
            })
            .collect();
        let content = policy.redact_text(content).unwrap_or_else(|| content.to_string());
        self.append(&Message::assistant_calls(content, logged.clone())).await?;

        let mut prepared = Vec::with_capacity(calls.len());
        for call in &calls {
            let args_text = call.args.to_string();
            let screened = rt.guardrails().evaluate_recorded(
                GuardrailInput::new(GuardrailPhase::PreTool, &args_text, self.session.facts())
                    .with_tool(&call.tool, &call.args),
                recorder,
            );
            if let Some(b) = screened.blocked {
                prepared.push(PreparedStep::Resolved(ToolOutcome::failure(b.to_failure())));
                continue;
            }
            let mut call = call.clone();
            if let Some(args) = screened.value {
                call.args = args;
            }

            let step = match call.specialist.clone() {
                None => PreparedStep::Tool(call),
                Some(name) if !self.options.allow_delegation => {
                    PreparedStep::Resolved(ToolOutcome::failure(ToolFailure::NotAllowed {
                        tool: format!("delegate:{}", name),
                    }))
                }
                Some(name) => match rt.delegator().specialist(&name) {
                    Some(specialist) => {
                        let mut handle = self.session.attach_subagent(specialist, &call.id);
                        handle.require_approval = self.options.require_approval;
                        PreparedStep::Delegate(call, handle)
                    }
                    None => PreparedStep::Resolved(ToolOutcome::failure(ToolFailure::Subagent {
                        specialist: name,
                        summary: "unknown specialist".to_string(),
                    })),
                },
            };
            prepared.push(step);
        }

        let session_id = self.session.id().to_string();
        let allowed = self.options.allowed_tools.clone();
        let require_approval = self.options.require_approval;
        let ctx = InvocationContext {
            session_id: &session_id,
            allowed_tools: allowed.as_deref(),
            require_approval,
            cancel,
            recorder,
        };
        // 只有会真正走到审批的调用才进入 AwaitingApproval
        let needs_approval = prepared.iter().any(|p| match p {
            PreparedStep::Tool(call) => {
                rt.router().requires_approval(&call.tool, require_approval) && rt.router().precheck(call, &ctx).is_ok()
            }
            _ => false,
        });
        if needs_approval {
            self.transition(SessionState::AwaitingApproval)?;
        }
        let delegated: Vec<String> = prepared
            .iter()
            .filter_map(|p| match p {
                PreparedStep::Delegate(_, h) => Some(h.child_session_id.clone()),
                _ => None,
            })
            .collect();
        if !delegated.is_empty() {
            self.transition(SessionState::Delegating)?;
        }

        let outcomes = {
            let ctx = &ctx;
            let permits = rt.delegator().turn_permits();
            let runner: Arc<dyn ChildRunner> = rt.clone();
            let tasks: Vec<_> = prepared
                .into_iter()
                .map(|step| {
                    let permits = permits.clone();
                    let runner = runner.clone();
                    async move {
                        match step {
                            PreparedStep::Resolved(outcome) => outcome,
                            PreparedStep::Tool(call) => rt.router().invoke(&call, ctx).await,
                            PreparedStep::Delegate(call, handle) => {
                                rt.delegator()
                                    .delegate(runner, handle, task_text(&call), permits, cancel, recorder)
                                    .await
                            }
                        }
                    }
                })
                .collect();
            TaskScheduler::new(rt.config().orchestrator.max_parallel_tools)
                .join_ordered(tasks)
                .await
        };
        for child in &delegated {
            self.session.detach_subagent(child);
        }

        self.transition(SessionState::Verifying)?;
        let mut verification = None;
        let mut results = Vec::with_capacity(calls.len());
        let remembered = &rt.config().memory.remembered_fields;
        for ((call, logged_call), outcome) in calls.iter().zip(&logged).zip(outcomes) {
            if outcome.is_success() && call.specialist.is_none() {
                collect_user_facts(&logged_call.args, remembered, &mut self.learned);
            }
            let outcome = match outcome {
                ToolOutcome::Success { payload } => {
                    let text = payload.to_string();
                    let screened = rt.guardrails().evaluate_recorded(
                        GuardrailInput::new(GuardrailPhase::PostTool, &text, self.session.facts())
                            .with_tool(&call.tool, &payload),
                        recorder,
                    );
                    match screened.blocked {
                        Some(b) => {
                            let failure = b.to_failure();
                            verification = Some(b);
                            ToolOutcome::failure(failure)
                        }
                        None => {
                            let payload = screened.value.unwrap_or(payload);
                            self.session.facts_mut().absorb(&payload);
                            ToolOutcome::success(payload)
                        }
                    }
                }
                failure => failure,
            };
            results.push(ToolCallResult::new(call.id.clone(), call.tool.clone(), outcome));
        }
        self.append(&Message::tool_results(results)).await?;
        Ok(verification)
    }

    fn verify_answer(&self, answer: &str) -> Result<String, BlockedBy> {
        let screened = self.rt.guardrails().evaluate_recorded(
            GuardrailInput::new(GuardrailPhase::PreResponse, answer, self.session.facts()),
            self.recorder,
        );
        match screened.blocked {
            Some(b) => Err(b),
            None => Ok(screened.content),
        }
    }

    /// 校验失败：计数，超过上限则失败，否则注入纠正提示回到 Planning
    async fn correct(&mut self, blocked: BlockedBy) -> Result<(), TurnFailure> {
        self.corrections += 1;
        let max = self.rt.config().orchestrator.max_verification_retries;
        if self.corrections > max {
            return Err(TurnFailure::new(
                blocked.code,
                format!("could not complete safely: {}", blocked.reason),
            ));
        }
        tracing::info!(
            session = %self.session.id(),
            check = %blocked.check,
            code = %blocked.code,
            attempt = self.corrections,
            "verification failed, replanning"
        );
        self.append(&Message::system(correction_note(&blocked))).await?;
        self.transition(SessionState::Planning)
    }

    async fn respond(&mut self, answer: String) -> Result<String, TurnFailure> {
        self.transition(SessionState::Responding)?;
        if let Some(subject) = &self.options.fact_subject {
            self.rt.memory().remember_facts(subject, &self.learned).await?;
        }
        let mut message = Message::assistant(answer.clone());
        if let Some(run_id) = self.last_model_run {
            message = message.with_run_id(run_id);
        }
        self.append(&message).await?;
        self.transition(SessionState::Done)?;
        Ok(answer)
    }
}

/// 从调用参数中取出需记住的字段；脱敏过的值不记
fn collect_user_facts(args: &Value, fields: &[String], learned: &mut Vec<(String, String)>) {
    let Some(obj) = args.as_object() else {
        return;
    };
    for field in fields {
        let value = match obj.get(field) {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => continue,
        };
        if value.is_empty() || value.contains(REDACTION) {
            continue;
        }
        learned.retain(|(k, _)| k != field);
        learned.push((field.clone(), value));
    }
}

fn correction_note(blocked: &BlockedBy) -> String {
    let hint = match blocked.code {
        ReasonCode::LowConfidence => "You need more information: search again with a more specific query or ask the user for details.",
        ReasonCode::MissingCitation => "Cite at least one retrieved passage as [id].",
        ReasonCode::UnknownSku => "Only mention SKUs that appeared in tool results.",
        ReasonCode::PriceCeilingExceeded => "Stay within the purchase limit or explain the limit to the user.",
        _ => "Revise your answer so that it passes this check.",
    };
    format!(
        "Correction: verification failed ({}): {}. {}",
        blocked.check, blocked.reason, hint
    )
}
