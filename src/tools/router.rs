//! ToolRouter：工具调用的唯一入口
//!
//! 顺序：allowlist → schema 校验 → 限流 → （危险工具或策略要求）审批 → 后端（超时 + 重试）。
//! precheck 只做前三步且不消耗限流配额，loop 据此决定是否进入审批等待。
//! 每一种结果（成功、各类失败、被跳过）都记录为一个 Tool Run；失败以 ToolOutcome::Failure 返回，从不抛出。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::approval::{ApprovalGate, ApprovalRequest, ApprovalStatus};
use crate::config::ToolsSection;
use crate::core::ToolFailure;
use crate::llm::ToolDescriptor;
use crate::memory::{ToolCallRequest, ToolOutcome};
use crate::observability::{Recorder, RunBuilder, RunKind, RunOutcome};
use crate::tools::{RateLimitResult, RateLimiter, Tool, ToolExecutor, ToolRegistry};

/// 规则强制审批时使用的风险类别
pub const POLICY_CATEGORY: &str = "policy";

/// 单次调用的上下文（调用意图）
#[derive(Clone, Copy)]
pub struct InvocationContext<'a> {
    pub session_id: &'a str,
    /// None 表示允许全部已注册工具
    pub allowed_tools: Option<&'a [String]>,
    /// 规则引擎要求本轮所有工具调用都先审批
    pub require_approval: bool,
    pub cancel: &'a CancellationToken,
    pub recorder: &'a Recorder,
}

impl<'a> InvocationContext<'a> {
    fn allows(&self, tool: &str) -> bool {
        self.allowed_tools
            .map(|allowed| allowed.iter().any(|t| t == tool))
            .unwrap_or(true)
    }
}

pub struct ToolRouter {
    registry: ToolRegistry,
    limiter: Arc<RateLimiter>,
    executor: ToolExecutor,
    approval: Arc<ApprovalGate>,
    dangerous: HashSet<String>,
    risk_categories: HashMap<String, String>,
}

impl ToolRouter {
    pub fn new(
        registry: ToolRegistry,
        limiter: Arc<RateLimiter>,
        executor: ToolExecutor,
        approval: Arc<ApprovalGate>,
    ) -> Self {
        Self {
            registry,
            limiter,
            executor,
            approval,
            dangerous: HashSet::new(),
            risk_categories: HashMap::new(),
        }
    }

    /// 按 [tools] 配置构造；限流器可由多个 runtime 共享
    pub fn from_config(
        cfg: &ToolsSection,
        registry: ToolRegistry,
        limiter: Arc<RateLimiter>,
        approval: Arc<ApprovalGate>,
    ) -> Self {
        Self::new(
            registry,
            limiter,
            ToolExecutor::new(cfg.timeout(), cfg.retry_policy()),
            approval,
        )
        .with_dangerous(cfg.dangerous.iter().cloned())
        .with_risk_categories(cfg.risk_categories.clone())
    }

    pub fn with_dangerous(mut self, tools: impl IntoIterator<Item = String>) -> Self {
        self.dangerous.extend(tools);
        self
    }

    pub fn with_risk_categories(mut self, categories: HashMap<String, String>) -> Self {
        self.risk_categories.extend(categories);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn approval(&self) -> &Arc<ApprovalGate> {
        &self.approval
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn descriptors(&self, allowed: Option<&[String]>) -> Vec<ToolDescriptor> {
        self.registry.descriptors(allowed)
    }

    /// 配置列表或适配器自身标记为危险
    pub fn is_dangerous(&self, tool: &str) -> bool {
        self.dangerous.contains(tool) || self.registry.get(tool).map(|t| t.dangerous()).unwrap_or(false)
    }

    /// 本次调用是否需要审批
    pub fn requires_approval(&self, tool: &str, forced: bool) -> bool {
        forced || self.is_dangerous(tool)
    }

    pub fn risk_category(&self, tool: &str) -> String {
        if let Some(category) = self.risk_categories.get(tool) {
            return category.clone();
        }
        self.registry
            .get(tool)
            .map(|t| t.risk_category().to_string())
            .unwrap_or_else(|| "general".to_string())
    }

    pub async fn invoke(&self, call: &ToolCallRequest, ctx: &InvocationContext<'_>) -> ToolOutcome {
        let builder = RunBuilder::start(RunKind::Tool, call.tool.clone())
            .metadata(json!({ "call_id": call.id, "session": ctx.session_id }));

        let outcome = self.route(call, ctx).await;

        let run_outcome = match &outcome {
            ToolOutcome::Success { .. } => RunOutcome::Success,
            ToolOutcome::Failure { error } => {
                let reached_backend = matches!(error, ToolFailure::Backend { .. } | ToolFailure::Cancelled);
                if reached_backend {
                    RunOutcome::Failure {
                        code: error.code(),
                        message: error.to_string(),
                    }
                } else {
                    RunOutcome::Skipped {
                        code: error.code(),
                        message: error.to_string(),
                    }
                }
            }
        };
        ctx.recorder.finish(builder, run_outcome);
        outcome
    }

    /// 不执行、不计数地检查 allowlist、schema 与限流余量
    pub fn precheck(&self, call: &ToolCallRequest, ctx: &InvocationContext<'_>) -> Result<(), ToolFailure> {
        self.admit(call, ctx, false).map(|_| ())
    }

    /// 1-3 步；consume 为 false 时只查看限流窗口且不记日志
    fn admit(
        &self,
        call: &ToolCallRequest,
        ctx: &InvocationContext<'_>,
        consume: bool,
    ) -> Result<Arc<dyn Tool>, ToolFailure> {
        // 1. allowlist
        let tool = match self.registry.get(&call.tool) {
            Some(tool) if ctx.allows(&call.tool) => tool,
            _ => {
                if consume {
                    tracing::warn!(tool = %call.tool, session = %ctx.session_id, "tool not allowed");
                }
                return Err(ToolFailure::NotAllowed {
                    tool: call.tool.clone(),
                });
            }
        };

        // 2. schema
        if let Err(detail) = tool.schema().validate(&call.args) {
            return Err(ToolFailure::InvalidArguments {
                tool: call.tool.clone(),
                detail,
            });
        }

        // 3. rate limit
        let limited = if consume {
            self.limiter.try_acquire(&call.tool, ctx.session_id)
        } else {
            self.limiter.check(&call.tool, ctx.session_id)
        };
        if let RateLimitResult::Limited { retry_after } = limited {
            if consume {
                tracing::warn!(
                    tool = %call.tool,
                    session = %ctx.session_id,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "tool rate limited"
                );
            }
            return Err(ToolFailure::RateLimited {
                tool: call.tool.clone(),
            });
        }
        Ok(tool)
    }

    async fn route(&self, call: &ToolCallRequest, ctx: &InvocationContext<'_>) -> ToolOutcome {
        let tool = match self.admit(call, ctx, true) {
            Ok(tool) => tool,
            Err(failure) => return ToolOutcome::failure(failure),
        };

        // 4. approval
        if self.requires_approval(&call.tool, ctx.require_approval) {
            if let Some(failure) = self.await_approval(call, ctx).await {
                return ToolOutcome::failure(failure);
            }
        }

        // 5. backend
        match self.executor.execute(&tool, &call.args, ctx.session_id, ctx.cancel).await {
            Ok(payload) => ToolOutcome::success(payload),
            Err(failure) => ToolOutcome::failure(failure),
        }
    }

    /// 等待审批终态；放行返回 None
    async fn await_approval(&self, call: &ToolCallRequest, ctx: &InvocationContext<'_>) -> Option<ToolFailure> {
        // 仅因策略要求审批的普通工具不走自动放行类别
        let category = if self.is_dangerous(&call.tool) {
            self.risk_category(&call.tool)
        } else {
            POLICY_CATEGORY.to_string()
        };
        let request = ApprovalRequest::new(ctx.session_id, call.tool.clone(), category, call.args.clone());
        let builder = RunBuilder::start(RunKind::Approval, call.tool.clone()).metadata(json!({
            "approval_id": request.id,
            "risk_category": request.risk_category,
        }));

        let outcome = self.approval.request(request, ctx.cancel).await;

        let failure = match outcome.status {
            ApprovalStatus::Approved => None,
            ApprovalStatus::Denied => Some(ToolFailure::ApprovalDenied {
                actor: outcome.actor.clone().unwrap_or_else(|| "operator".to_string()),
                note: outcome.note.clone(),
            }),
            ApprovalStatus::TimedOut => Some(ToolFailure::ApprovalTimedOut),
            ApprovalStatus::Cancelled | ApprovalStatus::Pending => Some(ToolFailure::Cancelled),
        };
        let run_outcome = match &failure {
            None => RunOutcome::Success,
            Some(f) => RunOutcome::Failure {
                code: f.code(),
                message: f.to_string(),
            },
        };
        ctx.recorder.finish(builder.tag(format!("{:?}", outcome.status).to_lowercase()), run_outcome);
        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalMode, ApprovalResponse, ChannelOperator, LogOnlyChannel};
    use crate::observability::InMemorySink;
    use crate::tools::{FieldSpec, RetryPolicy, ToolError, ToolSchema};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Checkout {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Tool for Checkout {
        fn name(&self) -> &str {
            "checkout"
        }
        fn description(&self) -> &str {
            "Place the order"
        }
        fn schema(&self) -> ToolSchema {
            ToolSchema::new().field(FieldSpec::string("user_id").required())
        }
        async fn invoke(&self, _args: Value) -> Result<Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"order_id": "ord-1"}))
        }
    }

    fn router(mode: ApprovalMode, quota: u32) -> (ToolRouter, Arc<Checkout>, Arc<ApprovalGate>) {
        let checkout = Arc::new(Checkout {
            calls: AtomicU32::new(0),
        });
        let mut registry = ToolRegistry::new();
        registry.register_arc(checkout.clone());
        let gate = Arc::new(ApprovalGate::new(
            mode,
            Duration::from_secs(5),
            vec!["general".to_string()],
            Arc::new(LogOnlyChannel),
        ));
        let router = ToolRouter::new(
            registry,
            Arc::new(RateLimiter::new(quota, Duration::from_secs(60))),
            ToolExecutor::new(Duration::from_secs(1), RetryPolicy::default()),
            gate.clone(),
        )
        .with_dangerous(vec!["checkout".to_string()])
        .with_risk_categories(HashMap::from([("checkout".to_string(), "payment".to_string())]));
        (router, checkout, gate)
    }

    #[tokio::test]
    async fn test_not_allowed_and_invalid_args_skip_backend() {
        let (router, checkout, _) = router(ApprovalMode::Auto, 10);
        let sink = InMemorySink::new();
        let recorder = Recorder::new(Arc::new(sink.clone()), "s1");
        let cancel = CancellationToken::new();
        let allowed = vec!["cart_view".to_string()];
        let ctx = InvocationContext {
            session_id: "s1",
            allowed_tools: Some(allowed.as_slice()),
            require_approval: false,
            cancel: &cancel,
            recorder: &recorder,
        };
        let call = ToolCallRequest::new("c1", "checkout", json!({"user_id": "u1"}));
        let out = router.invoke(&call, &ctx).await;
        assert!(matches!(out.failure_ref(), Some(ToolFailure::NotAllowed { .. })));

        let ctx = InvocationContext { allowed_tools: None, ..ctx };
        let call = ToolCallRequest::new("c2", "checkout", json!({}));
        let out = router.invoke(&call, &ctx).await;
        assert!(matches!(out.failure_ref(), Some(ToolFailure::InvalidArguments { .. })));

        assert_eq!(checkout.calls.load(Ordering::SeqCst), 0);
        let runs = sink.runs();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| matches!(r.outcome, RunOutcome::Skipped { .. })));
    }

    #[tokio::test]
    async fn test_rate_limited_before_backend() {
        let (router, checkout, gate) = router(ApprovalMode::Auto, 1);
        let recorder = Recorder::new(Arc::new(InMemorySink::new()), "s1");
        let cancel = CancellationToken::new();
        let ctx = InvocationContext {
            session_id: "s1",
            allowed_tools: None,
            require_approval: false,
            cancel: &cancel,
            recorder: &recorder,
        };
        let call = ToolCallRequest::new("c1", "checkout", json!({"user_id": "u1"}));

        // payment 不在自动放行类别中：由操作员批准
        let approve = {
            let gate = gate.clone();
            tokio::spawn(async move {
                loop {
                    if let Some(req) = gate.pending_requests().first() {
                        gate.resolve(ApprovalResponse::approve(req.id, "ops")).unwrap();
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            })
        };
        assert!(router.invoke(&call, &ctx).await.is_success());
        approve.await.unwrap();

        let out = router.invoke(&call, &ctx).await;
        assert!(matches!(out.failure_ref(), Some(ToolFailure::RateLimited { .. })));
        assert_eq!(checkout.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gate.audit_log().len(), 1);
    }

    #[tokio::test]
    async fn test_precheck_reports_without_consuming() {
        let (router, checkout, gate) = router(ApprovalMode::Auto, 1);
        let recorder = Recorder::new(Arc::new(InMemorySink::new()), "s1");
        let cancel = CancellationToken::new();
        let ctx = InvocationContext {
            session_id: "s1",
            allowed_tools: None,
            require_approval: false,
            cancel: &cancel,
            recorder: &recorder,
        };
        let bad = ToolCallRequest::new("c1", "checkout", json!({"user_id": 7}));
        assert!(matches!(router.precheck(&bad, &ctx), Err(ToolFailure::InvalidArguments { .. })));

        let good = ToolCallRequest::new("c2", "checkout", json!({"user_id": "u1"}));
        for _ in 0..3 {
            assert!(router.precheck(&good, &ctx).is_ok());
        }
        assert!(router.limiter().check("checkout", "s1").is_allowed());
        assert_eq!(checkout.calls.load(Ordering::SeqCst), 0);
        assert!(gate.audit_log().is_empty());
    }

    #[tokio::test]
    async fn test_policy_forces_approval_on_plain_tool() {
        let checkout = Arc::new(Checkout {
            calls: AtomicU32::new(0),
        });
        let mut registry = ToolRegistry::new();
        registry.register_arc(checkout.clone());
        // general 在自动放行类别里，但策略审批不走该类别
        let gate = Arc::new(ApprovalGate::new(
            ApprovalMode::Auto,
            Duration::from_secs(5),
            vec!["general".to_string()],
            Arc::new(LogOnlyChannel),
        ));
        let router = ToolRouter::new(
            registry,
            Arc::new(RateLimiter::new(10, Duration::from_secs(60))),
            ToolExecutor::new(Duration::from_secs(1), RetryPolicy::default()),
            gate.clone(),
        );
        assert!(!router.requires_approval("checkout", false));
        assert!(router.requires_approval("checkout", true));

        let recorder = Recorder::new(Arc::new(InMemorySink::new()), "s1");
        let cancel = CancellationToken::new();
        let ctx = InvocationContext {
            session_id: "s1",
            allowed_tools: None,
            require_approval: true,
            cancel: &cancel,
            recorder: &recorder,
        };
        let deny = {
            let gate = gate.clone();
            tokio::spawn(async move {
                loop {
                    if let Some(req) = gate.pending_requests().first() {
                        assert_eq!(req.risk_category, POLICY_CATEGORY);
                        gate.resolve(ApprovalResponse::deny(req.id, "ops", None)).unwrap();
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            })
        };
        let call = ToolCallRequest::new("c1", "checkout", json!({"user_id": "u1"}));
        let out = router.invoke(&call, &ctx).await;
        deny.await.unwrap();
        assert!(matches!(out.failure_ref(), Some(ToolFailure::ApprovalDenied { .. })));
        assert_eq!(checkout.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dangerous_tool_waits_for_terminal_approval() {
        let (operator, mut requests) = ChannelOperator::new();
        let checkout = Arc::new(Checkout {
            calls: AtomicU32::new(0),
        });
        let mut registry = ToolRegistry::new();
        registry.register_arc(checkout.clone());
        let gate = Arc::new(ApprovalGate::new(
            ApprovalMode::Manual,
            Duration::from_secs(30),
            Vec::new(),
            Arc::new(operator),
        ));
        let router = ToolRouter::new(
            registry,
            Arc::new(RateLimiter::new(10, Duration::from_secs(60))),
            ToolExecutor::new(Duration::from_secs(1), RetryPolicy::default()),
            gate.clone(),
        )
        .with_dangerous(vec!["checkout".to_string()]);

        let deny = {
            let gate = gate.clone();
            let checkout = checkout.clone();
            tokio::spawn(async move {
                let req = requests.recv().await.unwrap();
                assert_eq!(checkout.calls.load(Ordering::SeqCst), 0);
                gate.resolve(ApprovalResponse::deny(req.id, "alice", Some("too pricey".into())))
                    .unwrap();
            })
        };

        let recorder = Recorder::new(Arc::new(InMemorySink::new()), "s1");
        let cancel = CancellationToken::new();
        let ctx = InvocationContext {
            session_id: "s1",
            allowed_tools: None,
            require_approval: false,
            cancel: &cancel,
            recorder: &recorder,
        };
        let call = ToolCallRequest::new("c1", "checkout", json!({"user_id": "u1"}));
        let out = router.invoke(&call, &ctx).await;
        deny.await.unwrap();

        match out.failure_ref() {
            Some(ToolFailure::ApprovalDenied { actor, .. }) => assert_eq!(actor, "alice"),
            other => panic!("expected denial, got {:?}", other),
        }
        assert_eq!(checkout.calls.load(Ordering::SeqCst), 0);
        assert_eq!(router.risk_category("checkout"), "general");
    }
}
