//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__APPROVAL__MODE=manual`）。
//! 配置在启动时构建一次，校验后以 `Arc<AppConfig>` 显式传给各组件。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::approval::{ApprovalMode, DEFAULT_AUDIT_CAPACITY};
use crate::llm::RetryConfig;
use crate::memory::{BackendTag, CompactionPolicy};
use crate::tools::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub orchestrator: OrchestratorSection,
    pub guardrails: GuardrailsConfig,
    pub approval: ApprovalSection,
    pub tools: ToolsSection,
    pub memory: MemorySection,
    pub subagents: SubagentsSection,
    pub rules: RulesSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 默认日志级别（RUST_LOG 优先）
    pub log_level: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            log_level: "info".to_string(),
        }
    }
}

/// [llm] 段：模型调用自身的重试预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl LlmSection {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// [orchestrator] 段：单轮的步数、校验重试与并发上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 单轮最多规划次数
    pub max_steps: usize,
    /// 校验失败后最多重新规划次数
    pub max_verification_retries: usize,
    /// 单个计划内并行执行的工具步骤上限
    pub max_parallel_tools: usize,
    /// 压缩后仍超过此值则本轮失败
    pub max_context_tokens: usize,
    /// 会话总 token 预算
    pub session_token_budget: usize,
    /// 基础指令（角色设定）
    pub system_prompt: String,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_steps: 8,
            max_verification_retries: 2,
            max_parallel_tools: 4,
            max_context_tokens: 32_000,
            session_token_budget: 200_000,
            system_prompt: "You are a careful shopping assistant. Use tools to look up facts before \
                            answering and never invent products, prices or SKUs."
                .to_string(),
        }
    }
}

/// [guardrails] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardrailsConfig {
    pub max_input_chars: usize,
    pub max_output_chars: usize,
    /// 大小写不敏感的禁用词
    pub blocklist_terms: Vec<String>,
    /// 需脱敏的正则
    pub pii_patterns: Vec<String>,
    pub price_ceiling: Option<f64>,
    /// 受价格上限约束的工具
    pub priced_tools: Vec<String>,
    pub require_citations: bool,
    /// 检索结果最高分低于此值视为低置信
    pub relevance_min_score: Option<f64>,
    pub sku_pattern: String,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            max_input_chars: 4_000,
            max_output_chars: 8_000,
            blocklist_terms: Vec::new(),
            pii_patterns: vec![
                r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}".to_string(),
                r"\b(?:\d[ -]?){13,16}\b".to_string(),
            ],
            price_ceiling: None,
            priced_tools: vec!["checkout".to_string(), "cart_add".to_string()],
            require_citations: false,
            relevance_min_score: None,
            sku_pattern: r"\bSKU-[A-Z0-9]+\b".to_string(),
        }
    }
}

/// [approval] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalSection {
    pub mode: ApprovalMode,
    pub timeout_secs: u64,
    /// auto 模式下直接放行的风险类别
    pub auto_approve_categories: Vec<String>,
    /// 审计日志最多保留的条数
    pub audit_capacity: usize,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            mode: ApprovalMode::Auto,
            timeout_secs: 120,
            auto_approve_categories: vec!["general".to_string(), "cart".to_string()],
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
        }
    }
}

impl ApprovalSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// [tools] 段：超时、重试、限流与危险工具
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 每个 (工具, 会话) 每窗口最多调用次数
    pub rate_limit_per_tool: u32,
    pub rate_limit_window_secs: u64,
    /// 需要审批的工具（与适配器自身的 dangerous 标记取并集）
    pub dangerous: Vec<String>,
    /// 工具名 -> 风险类别
    pub risk_categories: HashMap<String, String>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            rate_limit_per_tool: 30,
            rate_limit_window_secs: 60,
            dangerous: vec!["checkout".to_string(), "cart_add".to_string()],
            risk_categories: HashMap::from([
                ("checkout".to_string(), "payment".to_string()),
                ("cart_add".to_string(), "cart".to_string()),
            ]),
        }
    }
}

impl ToolsSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}

/// [[memory.routes]]：composite 后端的分段前缀路由
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MemoryRoute {
    pub prefix: String,
    pub backend: String,
}

/// [memory] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// ephemeral / filesystem / long-term / composite
    pub backend: String,
    /// filesystem 后端根目录
    pub path: PathBuf,
    /// long-term 后端数据库文件
    pub long_term_path: PathBuf,
    pub compaction_token_threshold: usize,
    pub keep_last_k_messages: usize,
    /// extractive / model
    pub summarizer: String,
    /// composite 未命中路由时使用的后端
    pub default_backend: String,
    pub routes: Vec<MemoryRoute>,
    /// 从成功工具调用参数中记住的用户字段，跨会话可见
    pub remembered_fields: Vec<String>,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            backend: "ephemeral".to_string(),
            path: PathBuf::from("./data/memory"),
            long_term_path: PathBuf::from("./data/memory/long_term.db"),
            compaction_token_threshold: 6_000,
            keep_last_k_messages: 12,
            summarizer: "extractive".to_string(),
            default_backend: "ephemeral".to_string(),
            routes: Vec::new(),
            remembered_fields: vec!["user_id".to_string(), "address".to_string(), "payment_method".to_string()],
        }
    }
}

impl MemorySection {
    pub fn compaction_policy(&self) -> CompactionPolicy {
        CompactionPolicy::new(self.compaction_token_threshold, self.keep_last_k_messages)
    }
}

/// [[rules.intents]]：一个意图的关键词
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct IntentKeywords {
    pub intent: String,
    pub keywords: Vec<String>,
}

fn default_allow() -> bool {
    true
}

/// [[rules.rules]]：命中某意图时的决定
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RuleSpec {
    pub intent: String,
    #[serde(default = "default_allow")]
    pub allow: bool,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub system_instructions: Vec<String>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
}

/// [rules] 段：内置规则集加上自定义意图与规则
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RulesSection {
    /// default（空）/ commerce
    pub ruleset: String,
    pub intents: Vec<IntentKeywords>,
    pub rules: Vec<RuleSpec>,
}

impl Default for RulesSection {
    fn default() -> Self {
        Self {
            ruleset: "default".to_string(),
            intents: Vec::new(),
            rules: Vec::new(),
        }
    }
}

/// [[subagents.specialists]]
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SpecialistConfig {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub tools: Vec<String>,
    #[serde(default)]
    pub max_steps: Option<usize>,
}

impl SpecialistConfig {
    fn new(name: &str, description: &str, system_prompt: &str, tools: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            system_prompt: system_prompt.to_string(),
            tools: tools.iter().map(|t| t.to_string()).collect(),
            max_steps: None,
        }
    }
}

/// [subagents] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubagentsSection {
    /// 每个父轮次同时运行的子智能体上限
    pub max_concurrent_subagents: usize,
    /// 子智能体默认步数上限
    pub max_steps: usize,
    pub specialists: Vec<SpecialistConfig>,
}

impl Default for SubagentsSection {
    fn default() -> Self {
        Self {
            max_concurrent_subagents: 2,
            max_steps: 4,
            specialists: default_specialists(),
        }
    }
}

impl SubagentsSection {
    pub fn specialist(&self, name: &str) -> Option<&SpecialistConfig> {
        self.specialists.iter().find(|s| s.name == name)
    }
}

fn default_specialists() -> Vec<SpecialistConfig> {
    vec![
        SpecialistConfig::new(
            "catalog",
            "Research products, inventory and pricing for comparisons or recommendations.",
            "You are a catalog specialist. Search the catalog, check inventory and compare prices. \
             Return a concise set of options with key tradeoffs.",
            &["catalog_search", "inventory_check", "pricing_lookup", "rag_search"],
        ),
        SpecialistConfig::new(
            "cart",
            "Manage cart contents when the user asks to add, remove or review items.",
            "You manage cart updates. Change the cart only when the user intent is explicit, \
             then summarize the updated cart.",
            &["cart_add", "cart_remove", "cart_view", "promo_check"],
        ),
        SpecialistConfig::new(
            "checkout",
            "Finalize checkout when required details are confirmed.",
            "You complete checkout only after user_id, address and payment method are confirmed. \
             Confirm cart totals before submitting.",
            &["checkout", "cart_view"],
        ),
        SpecialistConfig::new(
            "order_support",
            "Handle order status and shipment tracking requests.",
            "You provide order status and shipment tracking updates.",
            &["order_status", "track_shipment"],
        ),
        SpecialistConfig::new(
            "returns",
            "Handle return requests and refund status checks.",
            "You create return requests and report refund status when asked.",
            &["return_request", "refund_status"],
        ),
        SpecialistConfig::new(
            "reorder",
            "Place reorders for previous purchases once the user confirms.",
            "You reorder items only after the user confirms the order id.",
            &["reorder"],
        ),
        SpecialistConfig::new(
            "support",
            "Open support tickets for issues that need escalation.",
            "You open support tickets with a clear subject and a concise issue summary.",
            &["support_ticket"],
        ),
    ]
}

impl AppConfig {
    /// 拒绝不一致的配置：零上限、未知后端、非法正则
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.orchestrator.max_steps == 0 {
            return invalid("orchestrator.max_steps must be > 0".into());
        }
        if self.orchestrator.max_parallel_tools == 0 {
            return invalid("orchestrator.max_parallel_tools must be > 0".into());
        }
        if self.orchestrator.max_context_tokens == 0 {
            return invalid("orchestrator.max_context_tokens must be > 0".into());
        }
        if self.memory.keep_last_k_messages == 0 {
            return invalid("memory.keep_last_k_messages must be > 0".into());
        }
        if self.memory.compaction_token_threshold > self.orchestrator.max_context_tokens {
            return invalid(format!(
                "memory.compaction_token_threshold ({}) exceeds orchestrator.max_context_tokens ({})",
                self.memory.compaction_token_threshold, self.orchestrator.max_context_tokens
            ));
        }
        if self.tools.rate_limit_per_tool == 0 || self.tools.rate_limit_window_secs == 0 {
            return invalid("tools rate limit and window must be > 0".into());
        }
        if self.tools.timeout_secs == 0 || self.tools.max_attempts == 0 {
            return invalid("tools.timeout_secs and tools.max_attempts must be > 0".into());
        }
        if self.approval.timeout_secs == 0 {
            return invalid("approval.timeout_secs must be > 0".into());
        }
        if self.approval.audit_capacity == 0 {
            return invalid("approval.audit_capacity must be > 0".into());
        }
        if self.subagents.max_concurrent_subagents == 0 {
            return invalid("subagents.max_concurrent_subagents must be > 0".into());
        }
        if self.guardrails.max_input_chars == 0 || self.guardrails.max_output_chars == 0 {
            return invalid("guardrails length limits must be > 0".into());
        }
        if let Some(ceiling) = self.guardrails.price_ceiling {
            if !(ceiling.is_finite() && ceiling >= 0.0) {
                return invalid(format!("guardrails.price_ceiling must be >= 0, got {}", ceiling));
            }
        }

        let backend = parse_backend(&self.memory.backend)?;
        if backend == BackendTag::Composite {
            if parse_backend(&self.memory.default_backend)? == BackendTag::Composite {
                return invalid("memory.default_backend cannot be composite".into());
            }
            for route in &self.memory.routes {
                if parse_backend(&route.backend)? == BackendTag::Composite {
                    return invalid(format!("memory route '{}' cannot target composite", route.prefix));
                }
            }
        }
        if !matches!(self.rules.ruleset.as_str(), "default" | "commerce") {
            return invalid(format!("unknown rules.ruleset '{}'", self.rules.ruleset));
        }
        if let Some(entry) = self.rules.intents.iter().find(|i| i.intent.is_empty() || i.keywords.is_empty()) {
            return invalid(format!("rules intent '{}' needs a name and keywords", entry.intent));
        }
        if self.rules.rules.iter().any(|r| r.intent.is_empty()) {
            return invalid("every rules.rules entry needs an intent".into());
        }
        if !matches!(self.memory.summarizer.as_str(), "extractive" | "model") {
            return invalid(format!("unknown memory.summarizer '{}'", self.memory.summarizer));
        }

        for pattern in self
            .guardrails
            .pii_patterns
            .iter()
            .chain(std::iter::once(&self.guardrails.sku_pattern))
        {
            Regex::new(pattern).map_err(|e| ConfigError::Invalid(format!("bad regex '{}': {}", pattern, e)))?;
        }
        Ok(())
    }
}

pub fn parse_backend(name: &str) -> Result<BackendTag, ConfigError> {
    BackendTag::parse(name).ok_or_else(|| ConfigError::Invalid(format!("unknown memory backend '{}'", name)))
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖，并校验
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}
