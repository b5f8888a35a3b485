//! 运行时构建器：统一的组件初始化逻辑
//!
//! 所有会话（包括子智能体）共享同一个 AgentRuntime：LLM、记忆、护栏、工具路由、审批门、委派器。
//! LLM 客户端与工具由调用方注入，其余组件按配置构建。

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::approval::{ApprovalChannel, ApprovalGate, LogOnlyChannel};
use crate::config::{load_config, parse_backend, AppConfig};
use crate::core::{AgentError, Orchestrator, RecoveryEngine, Session};
use crate::guardrails::GuardrailPipeline;
use crate::llm::{LlmClient, RetryingLlmClient};
use crate::memory::{
    BackendTag, CompactionPolicy, CompositeBackend, EphemeralBackend, ExtractiveSummarizer, FilesystemBackend,
    LongTermBackend, MemoryBackend, MemoryManager, ModelSummarizer, Summarizer,
};
use crate::observability::{ObservabilitySink, Recorder, TracingSink};
use crate::react::{run_turn, Planner, TurnOptions};
use crate::rules::RulesEngine;
use crate::subagent::{ChildReport, ChildRunner, ChildStatus, ChildTask, SubagentDelegator};
use crate::tools::{RateLimiter, Tool, ToolRegistry, ToolRouter};

/// 预构建的共享组件，可多会话共享
pub struct AgentRuntime {
    config: Arc<AppConfig>,
    llm: Arc<dyn LlmClient>,
    planner: Planner,
    memory: MemoryManager,
    guardrails: GuardrailPipeline,
    router: ToolRouter,
    delegator: SubagentDelegator,
    sink: Arc<dyn ObservabilitySink>,
    recovery: RecoveryEngine,
    rules: RulesEngine,
}

impl AgentRuntime {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn guardrails(&self) -> &GuardrailPipeline {
        &self.guardrails
    }

    pub fn router(&self) -> &ToolRouter {
        &self.router
    }

    pub fn delegator(&self) -> &SubagentDelegator {
        &self.delegator
    }

    pub fn sink(&self) -> &Arc<dyn ObservabilitySink> {
        &self.sink
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    pub fn rules(&self) -> &RulesEngine {
        &self.rules
    }

    pub fn compaction_policy(&self) -> CompactionPolicy {
        self.config.memory.compaction_policy()
    }

    /// 新建一个会话的编排器
    pub fn orchestrator(self: &Arc<Self>, session_id: impl Into<String>) -> Orchestrator {
        Orchestrator::new(self.clone(), session_id)
    }
}

impl ChildRunner for AgentRuntime {
    fn run_child(self: Arc<Self>, task: ChildTask, cancel: tokio_util::sync::CancellationToken) -> BoxFuture<'static, ChildReport> {
        Box::pin(async move {
            let child_id = task.handle.child_session_id.clone();
            let mut session = Session::new(child_id.clone(), self.config.orchestrator.session_token_budget);
            let recorder = Recorder::new(self.sink.clone(), child_id.clone());
            let mut options = TurnOptions::for_specialist(&task.specialist, task.max_steps);
            options.require_approval = task.handle.require_approval;

            let outcome = run_turn(&self, &mut session, &options, &task.task, &cancel, &recorder).await;
            let status = if outcome.is_done() {
                ChildStatus::Completed {
                    answer: outcome.response,
                }
            } else {
                ChildStatus::Failed {
                    code: outcome.reason.unwrap_or(crate::core::ReasonCode::InternalError),
                    summary: outcome.response,
                }
            };
            ChildReport {
                child_session_id: child_id,
                status,
            }
        })
    }
}

/// 运行时构建器
pub struct RuntimeBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    tools: ToolRegistry,
    memory_backend: Option<Arc<dyn MemoryBackend>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    approval_channel: Option<Arc<dyn ApprovalChannel>>,
    sink: Option<Arc<dyn ObservabilitySink>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    fact_store: Option<Arc<LongTermBackend>>,
}

impl RuntimeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            tools: ToolRegistry::new(),
            memory_backend: None,
            summarizer: None,
            approval_channel: None,
            sink: None,
            rate_limiter: None,
            fact_store: None,
        }
    }

    /// 从配置文件（或默认搜索路径）创建
    pub fn from_config_path(config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let config = load_config(config_path)?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn tool_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.register_arc(tool);
        self
    }

    /// 覆盖配置中的记忆后端
    pub fn memory_backend(mut self, backend: Arc<dyn MemoryBackend>) -> Self {
        self.memory_backend = Some(backend);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn approval_channel(mut self, channel: Arc<dyn ApprovalChannel>) -> Self {
        self.approval_channel = Some(channel);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// 跨会话用户资料库；未设置时沿用配置中的 long-term 后端（若有）
    pub fn fact_store(mut self, store: Arc<LongTermBackend>) -> Self {
        self.fact_store = Some(store);
        self
    }

    /// 与其他 runtime 共享限流状态
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub async fn build(self) -> Result<Arc<AgentRuntime>, AgentError> {
        let cfg = self.config;
        cfg.validate().map_err(|e| AgentError::ConfigError(e.to_string()))?;

        let raw_llm = self
            .llm
            .ok_or_else(|| AgentError::ConfigError("no LLM client configured".to_string()))?;
        let llm: Arc<dyn LlmClient> = Arc::new(RetryingLlmClient::new(raw_llm, cfg.llm.retry_config()));

        let mut long_term = None;
        let backend = match self.memory_backend {
            Some(b) => b,
            None => build_backend(&cfg, &mut long_term).await?,
        };
        let fact_store = self.fact_store.or(long_term);
        let summarizer: Arc<dyn Summarizer> = match self.summarizer {
            Some(s) => s,
            None if cfg.memory.summarizer == "model" => Arc::new(ModelSummarizer::new(llm.clone())),
            None => Arc::new(ExtractiveSummarizer::default()),
        };

        let channel = self.approval_channel.unwrap_or_else(|| Arc::new(LogOnlyChannel) as Arc<dyn ApprovalChannel>);
        let approval = Arc::new(ApprovalGate::new(
            cfg.approval.mode,
            cfg.approval.timeout(),
            cfg.approval.auto_approve_categories.iter().cloned(),
            channel,
        )
        .with_audit_capacity(cfg.approval.audit_capacity));
        let limiter = self
            .rate_limiter
            .unwrap_or_else(|| Arc::new(RateLimiter::new(cfg.tools.rate_limit_per_tool, cfg.tools.rate_limit_window())));
        let router = ToolRouter::from_config(&cfg.tools, self.tools, limiter, approval);

        tracing::info!(
            tools = router.registry().tool_names().len(),
            backend = ?backend.tag(),
            approval = ?cfg.approval.mode,
            "runtime built"
        );

        Ok(Arc::new(AgentRuntime {
            planner: Planner::new(llm.clone()),
            memory: match fact_store {
                Some(store) => MemoryManager::new(backend, summarizer).with_facts(store),
                None => MemoryManager::new(backend, summarizer),
            },
            guardrails: GuardrailPipeline::from_config(&cfg.guardrails)?,
            router,
            delegator: SubagentDelegator::from_config(&cfg.subagents),
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink) as Arc<dyn ObservabilitySink>),
            recovery: RecoveryEngine::new(),
            rules: RulesEngine::from_config(&cfg.rules),
            llm,
            config: Arc::new(cfg),
        }))
    }
}

/// long_term 收集（并复用）构建出的 long-term 实例，供用户资料使用
async fn build_single(
    tag: BackendTag,
    cfg: &AppConfig,
    long_term: &mut Option<Arc<LongTermBackend>>,
) -> Result<Arc<dyn MemoryBackend>, AgentError> {
    let backend: Arc<dyn MemoryBackend> = match tag {
        BackendTag::Ephemeral => Arc::new(EphemeralBackend::new()),
        BackendTag::Filesystem => Arc::new(FilesystemBackend::new(&cfg.memory.path)),
        BackendTag::LongTerm => match long_term.clone() {
            Some(store) => store,
            None => {
                let store = Arc::new(LongTermBackend::open(&cfg.memory.long_term_path).await?);
                *long_term = Some(store.clone());
                store
            }
        },
        BackendTag::Composite => {
            return Err(AgentError::ConfigError("composite backends cannot be nested".to_string()))
        }
    };
    Ok(backend)
}

async fn build_backend(
    cfg: &AppConfig,
    long_term: &mut Option<Arc<LongTermBackend>>,
) -> Result<Arc<dyn MemoryBackend>, AgentError> {
    let tag = parse_backend(&cfg.memory.backend).map_err(|e| AgentError::ConfigError(e.to_string()))?;
    if tag != BackendTag::Composite {
        return build_single(tag, cfg, long_term).await;
    }

    let fallback_tag =
        parse_backend(&cfg.memory.default_backend).map_err(|e| AgentError::ConfigError(e.to_string()))?;
    let mut composite = CompositeBackend::new(build_single(fallback_tag, cfg, long_term).await?);
    for route in &cfg.memory.routes {
        let tag = parse_backend(&route.backend).map_err(|e| AgentError::ConfigError(e.to_string()))?;
        composite = composite.route(route.prefix.clone(), build_single(tag, cfg, long_term).await?);
    }
    Ok(Arc::new(composite))
}
