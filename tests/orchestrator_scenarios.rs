//! 编排端到端场景测试：脚本化模型 + 桩工具

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use hive::approval::{ApprovalMode, ApprovalResponse, ApprovalStatus, ChannelOperator};
use hive::config::{AppConfig, IntentKeywords, RuleSpec};
use hive::core::{AgentRuntime, ReasonCode, RuntimeBuilder, SessionState, ToolFailure};
use hive::llm::{LlmError, ModelReply, ScriptedLlmClient};
use hive::memory::{
    dangling_calls, BackendTag, LongTermBackend, MemoryBackend, MemoryError, MemoryKey, Message, ReadRange,
    ToolCallResult, ToolOutcome,
};
use hive::observability::{InMemorySink, RunKind};
use hive::tools::{FieldSpec, Tool, ToolError, ToolSchema};

struct StubTool {
    name: &'static str,
    delay: Duration,
    reply: Value,
    calls: Arc<AtomicUsize>,
}

impl StubTool {
    fn new(name: &'static str, reply: Value) -> Self {
        Self {
            name,
            delay: Duration::ZERO,
            reply,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Tool for StubTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "stub tool"
    }

    async fn invoke(&self, _args: Value) -> Result<Value, ToolError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

fn results_of(log: &[Message]) -> Vec<ToolCallResult> {
    log.iter().flat_map(|m| m.tool_results.clone()).collect()
}

fn failure_codes(log: &[Message]) -> Vec<ReasonCode> {
    results_of(log)
        .iter()
        .filter_map(|r| r.outcome.failure_ref().map(ToolFailure::code))
        .collect()
}

#[tokio::test]
async fn test_price_ceiling_blocks_checkout_before_approval() {
    let mut cfg = AppConfig::default();
    cfg.guardrails.price_ceiling = Some(500.0);
    cfg.approval.mode = ApprovalMode::Manual;

    let llm = Arc::new(ScriptedLlmClient::with_replies([
        ModelReply::text(r#"{"tool": "checkout", "args": {"total": 799.0}}"#),
        ModelReply::text("That order is above your 500.00 limit, so I did not place it."),
    ]));
    let checkout = StubTool::new("checkout", json!({"order_id": "o-1"}));
    let checkout_calls = checkout.calls.clone();
    let (operator, mut approvals) = ChannelOperator::new();
    let sink = InMemorySink::new();

    let rt = RuntimeBuilder::new(cfg)
        .llm(llm.clone())
        .tool(checkout)
        .approval_channel(Arc::new(operator))
        .sink(Arc::new(sink.clone()))
        .build()
        .await
        .unwrap();
    let mut orch = rt.orchestrator("s1");
    let out = orch.submit("buy the espresso machine").await;

    assert!(out.is_done());
    assert!(out.response.contains("limit"));
    assert!(!out.states.contains(&SessionState::AwaitingApproval));
    assert_eq!(checkout_calls.load(Ordering::SeqCst), 0);
    assert!(approvals.try_recv().is_err());
    assert!(rt.router().approval().audit_log().is_empty());

    let log = orch.history().await.unwrap();
    assert_eq!(failure_codes(&log), vec![ReasonCode::PriceCeilingExceeded]);
    assert!(sink.runs().iter().all(|r| r.kind != RunKind::Tool && r.kind != RunKind::Approval));
    let blocked = sink
        .runs()
        .into_iter()
        .find(|r| r.kind == RunKind::Guardrail && r.name == "guardrails:pre-tool")
        .unwrap();
    assert!(!blocked.is_success());
}

#[tokio::test]
async fn test_low_relevance_exhausts_verification_retries() {
    let mut cfg = AppConfig::default();
    cfg.guardrails.relevance_min_score = Some(0.5);
    cfg.orchestrator.max_verification_retries = 1;

    let search = r#"{"tool": "rag_search", "args": {"query": "warranty for kettle"}}"#;
    let llm = Arc::new(ScriptedLlmClient::with_replies([
        ModelReply::text(search),
        ModelReply::text(search),
        ModelReply::text("should never be used"),
    ]));
    let rt = RuntimeBuilder::new(cfg)
        .llm(llm.clone())
        .tool(StubTool::new(
            "rag_search",
            json!({"passages": [{"id": "p1", "score": 0.2, "text": "unrelated"}]}),
        ))
        .build()
        .await
        .unwrap();
    let mut orch = rt.orchestrator("s2");
    let out = orch.submit("what is the kettle warranty?").await;

    assert!(!out.is_done());
    assert_eq!(out.reason, Some(ReasonCode::LowConfidence));
    assert!(out.response.starts_with("could not complete safely"));
    assert_eq!(
        out.states,
        vec![
            SessionState::Planning,
            SessionState::Acting,
            SessionState::Verifying,
            SessionState::Planning,
            SessionState::Acting,
            SessionState::Verifying,
            SessionState::Failed,
        ]
    );
    assert_eq!(llm.calls(), 2);
    let second_request = &llm.requests()[1];
    assert!(second_request.iter().any(|m| m.content.contains("need more information")));

    let log = orch.history().await.unwrap();
    assert!(dangling_calls(&log).is_empty());
    assert!(log.iter().all(|m| m.role != hive::memory::Role::Assistant || !m.tool_calls.is_empty()));
}

#[tokio::test(start_paused = true)]
async fn test_manual_approval_timeout_replans() {
    let mut cfg = AppConfig::default();
    cfg.approval.mode = ApprovalMode::Manual;
    cfg.approval.timeout_secs = 5;

    let llm = Arc::new(ScriptedLlmClient::with_replies([
        ModelReply::text(r#"{"tool": "checkout", "args": {"total": 120.0}}"#),
        ModelReply::text("Nobody approved the checkout in time, so the order was not placed."),
    ]));
    let checkout = StubTool::new("checkout", json!({"order_id": "o-2"}));
    let checkout_calls = checkout.calls.clone();
    let rt = RuntimeBuilder::new(cfg)
        .llm(llm)
        .tool(checkout)
        .build()
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let mut orch = rt.orchestrator("s3");
    let out = orch.submit("check out my cart").await;

    assert!(out.is_done());
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(out.states.contains(&SessionState::AwaitingApproval));
    assert_eq!(checkout_calls.load(Ordering::SeqCst), 0);

    let log = orch.history().await.unwrap();
    assert_eq!(failure_codes(&log), vec![ReasonCode::ApprovalTimedOut]);
    let audit = rt.router().approval().audit_log();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].status, ApprovalStatus::TimedOut);
}

async fn parallel_runtime() -> (Arc<AgentRuntime>, Arc<ScriptedLlmClient>) {
    let llm = Arc::new(ScriptedLlmClient::with_replies([
        ModelReply::text(
            r#"{"calls": [
                {"tool": "inventory_check", "args": {"sku": "SKU-KETTLE1"}},
                {"tool": "pricing_lookup", "args": {"sku": "SKU-KETTLE1"}}
            ]}"#,
        ),
        ModelReply::text("SKU-KETTLE1 is in stock at 39.99."),
    ]));
    let rt = RuntimeBuilder::new(AppConfig::default())
        .llm(llm.clone())
        .tool(
            StubTool::new("inventory_check", json!({"sku": "SKU-KETTLE1", "in_stock": 12}))
                .delayed(Duration::from_millis(300)),
        )
        .tool(
            StubTool::new("pricing_lookup", json!({"sku": "SKU-KETTLE1", "price": 39.99}))
                .delayed(Duration::from_millis(10)),
        )
        .build()
        .await
        .unwrap();
    (rt, llm)
}

#[tokio::test(start_paused = true)]
async fn test_parallel_steps_merge_in_plan_order() {
    let (rt, _llm) = parallel_runtime().await;
    let mut orch = rt.orchestrator("s4");

    let started = tokio::time::Instant::now();
    let out = orch.submit("is the kettle in stock and how much is it?").await;
    let elapsed = started.elapsed();

    assert!(out.is_done());
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(310));

    let log = orch.history().await.unwrap();
    let results = results_of(&log);
    let tools: Vec<&str> = results.iter().map(|r| r.tool.as_str()).collect();
    assert_eq!(tools, vec!["inventory_check", "pricing_lookup"]);
    assert!(results.iter().all(|r| r.outcome.is_success()));
    assert_eq!(orch.session().facts().price_of("SKU-KETTLE1"), Some(39.99));
}

#[tokio::test(start_paused = true)]
async fn test_same_script_same_outcome() {
    let mut runs = Vec::new();
    for _ in 0..2 {
        let (rt, _llm) = parallel_runtime().await;
        let mut orch = rt.orchestrator("det");
        let out = orch.submit("is the kettle in stock and how much is it?").await;
        let log = orch.history().await.unwrap();
        runs.push((out.states, out.response, results_of(&log)));
    }
    assert_eq!(runs[0], runs[1]);
}

#[tokio::test]
async fn test_failed_subagent_reports_and_parent_continues() {
    let llm = Arc::new(ScriptedLlmClient::new());
    llm.push_reply(ModelReply::text(
        r#"{"specialist": "returns", "args": {"task": "refund order 7"}}"#,
    ));
    llm.push_error(LlmError::InvalidResponse("truncated body".to_string()));
    llm.push_reply(ModelReply::text("The returns desk is unavailable right now; please try again later."));

    let sink = InMemorySink::new();
    let rt = RuntimeBuilder::new(AppConfig::default())
        .llm(llm.clone())
        .tool(StubTool::new("return_request", json!({"rma": "r-7"})))
        .sink(Arc::new(sink.clone()))
        .build()
        .await
        .unwrap();
    let mut orch = rt.orchestrator("s5");
    let out = orch.submit("I want a refund for order 7").await;

    assert!(out.is_done());
    assert!(out.states.contains(&SessionState::Delegating));
    assert_eq!(llm.calls(), 3);
    assert_eq!(orch.snapshot(false).active_subagents, 0);

    let log = orch.history().await.unwrap();
    assert_eq!(failure_codes(&log), vec![ReasonCode::SubagentFailure]);

    let child = sink.thread("s5/sub-1");
    assert_eq!(child.traces.len(), 1);
    assert_eq!(child.traces[0].reason, Some(ReasonCode::ModelError));
    let delegated = sink.runs().into_iter().find(|r| r.kind == RunKind::Subagent).unwrap();
    assert_eq!(delegated.name, "returns");
    assert!(!delegated.is_success());
}

#[tokio::test]
async fn test_subagent_cannot_use_tools_outside_allowlist() {
    let llm = Arc::new(ScriptedLlmClient::new());
    llm.push_reply(ModelReply::text(r#"{"specialist": "returns", "args": {"task": "refund order 7"}}"#));
    // 子智能体试图调用 checkout（不在 returns 的 allowlist 中）
    llm.push_reply(ModelReply::text(r#"{"tool": "checkout", "args": {"total": 10.0}}"#));
    llm.push_reply(ModelReply::text("I can only handle returns."));
    llm.push_reply(ModelReply::text("The returns specialist could not help with that."));

    let checkout = StubTool::new("checkout", json!({"order_id": "o-9"}));
    let checkout_calls = checkout.calls.clone();
    let rt = RuntimeBuilder::new(AppConfig::default())
        .llm(llm)
        .tool(checkout)
        .build()
        .await
        .unwrap();
    let mut orch = rt.orchestrator("s6");
    let out = orch.submit("refund order 7 and buy it again").await;

    assert!(out.is_done());
    assert_eq!(checkout_calls.load(Ordering::SeqCst), 0);
    let child_log = rt.memory().read("s6/sub-1", ReadRange::All).await.unwrap();
    assert_eq!(failure_codes(&child_log), vec![ReasonCode::ToolNotAllowed]);

    let parent_log = orch.history().await.unwrap();
    let results = results_of(&parent_log);
    assert_eq!(results.len(), 1);
    match &results[0].outcome {
        ToolOutcome::Success { payload } => {
            assert_eq!(payload["specialist"], "returns");
            assert_eq!(payload["answer"], "I can only handle returns.");
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_tool_leaves_no_dangling_calls() {
    let llm = Arc::new(ScriptedLlmClient::with_replies([
        ModelReply::text(r#"{"tool": "order_status", "args": {"order_id": "7"}}"#),
        ModelReply::text("Your next question is answered."),
    ]));
    let rt = RuntimeBuilder::new(AppConfig::default())
        .llm(llm)
        .tool(StubTool::new("order_status", json!({"status": "shipped"})).delayed(Duration::from_secs(60)))
        .build()
        .await
        .unwrap();
    let mut orch = rt.orchestrator("s7");

    let token = orch.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
    });
    let out = orch.submit("where is order 7?").await;
    assert_eq!(out.reason, Some(ReasonCode::Cancelled));
    assert_eq!(out.states.last(), Some(&SessionState::Failed));

    let log = orch.history().await.unwrap();
    assert!(dangling_calls(&log).is_empty());
    assert_eq!(failure_codes(&log), vec![ReasonCode::Cancelled]);

    let next = orch.submit("thanks, anything else?").await;
    assert!(next.is_done());
}

struct FailingBackend;

#[async_trait]
impl MemoryBackend for FailingBackend {
    fn tag(&self) -> BackendTag {
        BackendTag::Ephemeral
    }

    async fn append(&self, _key: &MemoryKey, _entry: &Message) -> Result<usize, MemoryError> {
        Err(MemoryError::Unavailable("disk full".to_string()))
    }

    async fn read(&self, _key: &MemoryKey, _range: ReadRange) -> Result<Vec<Message>, MemoryError> {
        Err(MemoryError::Unavailable("disk full".to_string()))
    }

    async fn replace_range(&self, _key: &MemoryKey, _range: Range<usize>, _summary: &Message) -> Result<(), MemoryError> {
        Err(MemoryError::Unavailable("disk full".to_string()))
    }

    async fn len(&self, _key: &MemoryKey) -> Result<usize, MemoryError> {
        Err(MemoryError::Unavailable("disk full".to_string()))
    }
}

#[tokio::test]
async fn test_memory_failure_fails_turn() {
    let llm = Arc::new(ScriptedLlmClient::with_replies([ModelReply::text("hello")]));
    let rt = RuntimeBuilder::new(AppConfig::default())
        .llm(llm.clone())
        .memory_backend(Arc::new(FailingBackend))
        .build()
        .await
        .unwrap();
    let mut orch = rt.orchestrator("s8");
    let out = orch.submit("hi").await;

    assert_eq!(out.reason, Some(ReasonCode::MemoryBackendError));
    assert_eq!(llm.calls(), 0);
    assert_eq!(orch.snapshot(false).state, SessionState::Failed);
}

#[tokio::test]
async fn test_malformed_plan_is_retried_with_correction() {
    let llm = Arc::new(ScriptedLlmClient::with_replies([
        ModelReply::text(r#"{"tool": "cart_view", "args": "#),
        ModelReply::text("Your cart is empty."),
    ]));
    let rt = RuntimeBuilder::new(AppConfig::default())
        .llm(llm.clone())
        .build()
        .await
        .unwrap();
    let mut orch = rt.orchestrator("s9");
    let out = orch.submit("what's in my cart?").await;

    assert!(out.is_done());
    assert_eq!(out.response, "Your cart is empty.");
    assert!(llm.requests()[1].iter().any(|m| m.content.contains("not valid JSON")));
}

#[tokio::test]
async fn test_step_limit() {
    let mut cfg = AppConfig::default();
    cfg.orchestrator.max_steps = 2;
    let call = r#"{"tool": "cart_view", "args": {}}"#;
    let llm = Arc::new(ScriptedLlmClient::with_replies([
        ModelReply::text(call),
        ModelReply::text(call),
        ModelReply::text(call),
    ]));
    let rt = RuntimeBuilder::new(cfg)
        .llm(llm.clone())
        .tool(StubTool::new("cart_view", json!({"items": []})))
        .build()
        .await
        .unwrap();
    let mut orch = rt.orchestrator("s10");
    let out = orch.submit("loop forever").await;

    assert_eq!(out.reason, Some(ReasonCode::StepLimitExceeded));
    assert_eq!(llm.calls(), 2);
}

#[tokio::test]
async fn test_tool_payload_redaction_keeps_numbers() {
    let llm = Arc::new(ScriptedLlmClient::with_replies([
        ModelReply::text(
            r#"{"tool": "pricing_lookup", "args": {"sku": "SKU-KETTLE1", "notify": "jane.doe@example.com"}}"#,
        ),
        ModelReply::text("SKU-KETTLE1 costs 39.99"),
    ]));
    let rt = RuntimeBuilder::new(AppConfig::default())
        .llm(llm)
        .tool(StubTool::new(
            "pricing_lookup",
            json!({
                "sku": "SKU-KETTLE1",
                "price": 39.99,
                "updated_at_ms": 1700000000000u64,
                "contact": "ops@example.com"
            }),
        ))
        .build()
        .await
        .unwrap();
    let mut orch = rt.orchestrator("s11");
    let out = orch.submit("how much is the kettle?").await;

    assert!(out.is_done());
    assert_eq!(out.response, "SKU-KETTLE1 costs 39.99");

    let log = orch.history().await.unwrap();
    let results = results_of(&log);
    assert_eq!(results.len(), 1);
    match &results[0].outcome {
        ToolOutcome::Success { payload } => {
            assert_eq!(payload["updated_at_ms"], json!(1700000000000u64));
            assert_eq!(payload["price"], json!(39.99));
            assert_eq!(payload["contact"], "[REDACTED]");
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let calls: Vec<_> = log.iter().flat_map(|m| m.tool_calls.clone()).collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].args["sku"], "SKU-KETTLE1");
    assert_eq!(calls[0].args["notify"], "[REDACTED]");
    assert!(log.iter().all(|m| !m.content.contains("jane.doe@example.com")));
}

struct CheckoutTool {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for CheckoutTool {
    fn name(&self) -> &str {
        "checkout"
    }

    fn description(&self) -> &str {
        "place an order for the current cart"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new().field(FieldSpec::string("user_id").required())
    }

    async fn invoke(&self, _args: Value) -> Result<Value, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"order_id": "o-3"}))
    }
}

#[tokio::test]
async fn test_invalid_arguments_fail_before_approval() {
    let mut cfg = AppConfig::default();
    cfg.approval.mode = ApprovalMode::Manual;

    let llm = Arc::new(ScriptedLlmClient::with_replies([
        ModelReply::text(r#"{"tool": "checkout", "args": {}}"#),
        ModelReply::text("I need your account id before I can place the order."),
    ]));
    let calls = Arc::new(AtomicUsize::new(0));
    let (operator, mut approvals) = ChannelOperator::new();
    let rt = RuntimeBuilder::new(cfg)
        .llm(llm)
        .tool(CheckoutTool { calls: calls.clone() })
        .approval_channel(Arc::new(operator))
        .build()
        .await
        .unwrap();
    let mut orch = rt.orchestrator("s12");
    let out = orch.submit("check out my cart").await;

    assert!(out.is_done());
    assert!(!out.states.contains(&SessionState::AwaitingApproval));
    assert!(approvals.try_recv().is_err());
    assert!(rt.router().approval().audit_log().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let log = orch.history().await.unwrap();
    assert_eq!(failure_codes(&log), vec![ReasonCode::InvalidArguments]);
}

#[tokio::test]
async fn test_refund_intent_forces_approval_and_instructions() {
    let mut cfg = AppConfig::default();
    cfg.rules.ruleset = "commerce".to_string();

    let llm = Arc::new(ScriptedLlmClient::with_replies([
        ModelReply::text(r#"{"tool": "refund_status", "args": {"order_id": "42"}}"#),
        ModelReply::text("Order 42 has been passed to our returns team."),
    ]));
    let refund = StubTool::new("refund_status", json!({"order_id": "42", "eligible": true}));
    let refund_calls = refund.calls.clone();
    let (operator, mut approvals) = ChannelOperator::new();
    let sink = InMemorySink::new();
    let rt = RuntimeBuilder::new(cfg)
        .llm(llm.clone())
        .tool(refund)
        .approval_channel(Arc::new(operator))
        .sink(Arc::new(sink.clone()))
        .build()
        .await
        .unwrap();

    let gate = rt.router().approval().clone();
    tokio::spawn(async move {
        if let Some(req) = approvals.recv().await {
            gate.resolve(ApprovalResponse::approve(req.id, "alice")).unwrap();
        }
    });

    let mut orch = rt.orchestrator("s13");
    let out = orch.submit("I want a refund for order 42").await;

    assert!(out.is_done());
    assert!(out.states.contains(&SessionState::AwaitingApproval));
    assert_eq!(refund_calls.load(Ordering::SeqCst), 1);

    let audit = rt.router().approval().audit_log();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].request.risk_category, "policy");
    assert_eq!(audit[0].status, ApprovalStatus::Approved);

    let system = &llm.requests()[0][0].content;
    assert!(system.contains("Detected intent: refund_request"));
    assert!(system.contains("Do not promise refunds"));

    let rules_run = sink.runs().into_iter().find(|r| r.name == "rules:refund_request").unwrap();
    assert_eq!(rules_run.kind, RunKind::Guardrail);
    assert!(rules_run.is_success());
}

#[tokio::test]
async fn test_denying_rule_blocks_turn_before_model() {
    let mut cfg = AppConfig::default();
    cfg.rules.intents.push(IntentKeywords {
        intent: "gift_card".to_string(),
        keywords: vec!["gift card".to_string()],
    });
    cfg.rules.rules.push(RuleSpec {
        intent: "gift_card".to_string(),
        allow: false,
        require_approval: false,
        notes: vec!["Gift cards are sold in store only.".to_string()],
        system_instructions: Vec::new(),
        allowed_tools: None,
    });

    let llm = Arc::new(ScriptedLlmClient::with_replies([ModelReply::text("never used")]));
    let rt = RuntimeBuilder::new(cfg)
        .llm(llm.clone())
        .build()
        .await
        .unwrap();
    let mut orch = rt.orchestrator("s14");
    let out = orch.submit("can I buy a gift card online?").await;

    assert_eq!(out.reason, Some(ReasonCode::PolicyBlocked));
    assert!(out.response.contains("in store only"));
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn test_rule_narrows_tools_for_the_turn() {
    let mut cfg = AppConfig::default();
    cfg.rules.ruleset = "commerce".to_string();
    cfg.rules.rules.push(RuleSpec {
        intent: "order_status".to_string(),
        allow: true,
        require_approval: false,
        notes: Vec::new(),
        system_instructions: Vec::new(),
        allowed_tools: Some(vec!["order_status".to_string()]),
    });

    let llm = Arc::new(ScriptedLlmClient::with_replies([
        ModelReply::text(r#"{"tool": "cart_view", "args": {}}"#),
        ModelReply::text("I can only look up order status right now."),
    ]));
    let cart = StubTool::new("cart_view", json!({"items": []}));
    let cart_calls = cart.calls.clone();
    let rt = RuntimeBuilder::new(cfg)
        .llm(llm)
        .tool(cart)
        .tool(StubTool::new("order_status", json!({"status": "shipped"})))
        .build()
        .await
        .unwrap();
    let mut orch = rt.orchestrator("s15");
    let out = orch.submit("where is my order 7?").await;

    assert!(out.is_done());
    assert_eq!(cart_calls.load(Ordering::SeqCst), 0);
    let log = orch.history().await.unwrap();
    assert_eq!(failure_codes(&log), vec![ReasonCode::ToolNotAllowed]);
}

#[tokio::test]
async fn test_user_details_carry_across_sessions() {
    let llm = Arc::new(ScriptedLlmClient::with_replies([
        ModelReply::text(r#"{"tool": "update_address", "args": {"address": "9 Oak Ave"}}"#),
        ModelReply::text("Your address is now 9 Oak Ave."),
        ModelReply::text("Your order will ship to 9 Oak Ave."),
    ]));
    let rt = RuntimeBuilder::new(AppConfig::default())
        .llm(llm.clone())
        .tool(StubTool::new("update_address", json!({"updated": true})))
        .fact_store(Arc::new(LongTermBackend::in_memory().await.unwrap()))
        .build()
        .await
        .unwrap();

    let mut first = rt.orchestrator("sa").with_user("u1");
    assert!(first.submit("please use 9 Oak Ave from now on").await.is_done());

    let mut second = rt.orchestrator("sb").with_user("u1");
    let out = second.submit("where will my order ship?").await;
    assert!(out.is_done());

    let requests = llm.requests();
    assert_eq!(requests.len(), 3);
    assert!(!requests[0][0].content.contains("Known user details"));
    assert!(requests[2][0].content.contains("Known user details: address=9 Oak Ave"));
}
