//! 内置护栏检查
//!
//! 每个检查声明适用的阶段，是 (内容, 策略, 显式传入的会话事实) 的纯函数：相同输入总是得到相同结论。

use std::fmt;

use serde_json::Value;

use crate::core::ReasonCode;
use crate::guardrails::facts::{extract_facts, TurnFacts};
use crate::guardrails::policy::GuardrailPolicy;

/// 护栏阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardrailPhase {
    /// 用户输入进入模型前
    PreModel,
    /// 工具调用执行前（检查参数）
    PreTool,
    /// 工具结果写入日志前
    PostTool,
    /// 最终答案返回前
    PreResponse,
}

impl GuardrailPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardrailPhase::PreModel => "pre-model",
            GuardrailPhase::PreTool => "pre-tool",
            GuardrailPhase::PostTool => "post-tool",
            GuardrailPhase::PreResponse => "pre-response",
        }
    }

    /// 该阶段检查的是输入侧还是输出侧内容
    pub fn is_input_side(&self) -> bool {
        matches!(self, GuardrailPhase::PreModel | GuardrailPhase::PreTool)
    }
}

impl fmt::Display for GuardrailPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个检查在单个阶段的结论
#[derive(Debug, Clone, PartialEq)]
pub enum GuardrailVerdict {
    Allow,
    /// 替换后的文本
    Redact(String),
    /// 替换后的结构化参数 / 载荷
    RedactValue(Value),
    Block { reason: String, code: ReasonCode },
}

impl GuardrailVerdict {
    pub fn block(code: ReasonCode, reason: impl Into<String>) -> Self {
        GuardrailVerdict::Block {
            reason: reason.into(),
            code,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            GuardrailVerdict::Allow => "allow",
            GuardrailVerdict::Redact(_) | GuardrailVerdict::RedactValue(_) => "redact",
            GuardrailVerdict::Block { .. } => "block",
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, GuardrailVerdict::Block { .. })
    }
}

/// 检查输入：content 是被检查的文本（参数或载荷序列化后的 JSON、用户输入、答案），
/// value 是结构化的参数 / 载荷（若有）
#[derive(Debug, Clone, Copy)]
pub struct GuardrailInput<'a> {
    pub phase: GuardrailPhase,
    pub content: &'a str,
    pub tool: Option<&'a str>,
    pub value: Option<&'a Value>,
    pub facts: &'a TurnFacts,
}

impl<'a> GuardrailInput<'a> {
    pub fn new(phase: GuardrailPhase, content: &'a str, facts: &'a TurnFacts) -> Self {
        Self {
            phase,
            content,
            tool: None,
            value: None,
            facts,
        }
    }

    pub fn with_tool(mut self, tool: &'a str, value: &'a Value) -> Self {
        self.tool = Some(tool);
        self.value = Some(value);
        self
    }
}

pub trait GuardrailCheck: Send + Sync {
    fn name(&self) -> &'static str;

    fn phases(&self) -> &'static [GuardrailPhase];

    fn applies_to(&self, phase: GuardrailPhase) -> bool {
        self.phases().contains(&phase)
    }

    fn check(&self, input: &GuardrailInput<'_>, policy: &GuardrailPolicy) -> GuardrailVerdict;
}

const ALL_PHASES: &[GuardrailPhase] = &[
    GuardrailPhase::PreModel,
    GuardrailPhase::PreTool,
    GuardrailPhase::PostTool,
    GuardrailPhase::PreResponse,
];

/// 默认检查列表（按评估顺序）
pub fn default_checks() -> Vec<Box<dyn GuardrailCheck>> {
    vec![
        Box::new(MaxLength),
        Box::new(Blocklist),
        Box::new(PiiRedaction),
        Box::new(PriceCeiling),
        Box::new(Relevance),
        Box::new(Citations),
        Box::new(SkuExistence),
    ]
}

pub struct MaxLength;

impl GuardrailCheck for MaxLength {
    fn name(&self) -> &'static str {
        "max_length"
    }

    fn phases(&self) -> &'static [GuardrailPhase] {
        ALL_PHASES
    }

    fn check(&self, input: &GuardrailInput<'_>, policy: &GuardrailPolicy) -> GuardrailVerdict {
        let limit = if input.phase.is_input_side() {
            policy.max_input_chars
        } else {
            policy.max_output_chars
        };
        let len = input.content.chars().count();
        if len > limit {
            GuardrailVerdict::block(
                ReasonCode::GuardrailBlocked,
                format!("{} content is {} chars, limit is {}", input.phase, len, limit),
            )
        } else {
            GuardrailVerdict::Allow
        }
    }
}

pub struct Blocklist;

impl GuardrailCheck for Blocklist {
    fn name(&self) -> &'static str {
        "blocklist"
    }

    fn phases(&self) -> &'static [GuardrailPhase] {
        ALL_PHASES
    }

    fn check(&self, input: &GuardrailInput<'_>, policy: &GuardrailPolicy) -> GuardrailVerdict {
        match policy.blocklist.iter().find(|(_, re)| re.is_match(input.content)) {
            Some((term, _)) => GuardrailVerdict::block(
                ReasonCode::GuardrailBlocked,
                format!("content contains blocked term '{}'", term),
            ),
            None => GuardrailVerdict::Allow,
        }
    }
}

pub struct PiiRedaction;

impl GuardrailCheck for PiiRedaction {
    fn name(&self) -> &'static str {
        "pii_redaction"
    }

    fn phases(&self) -> &'static [GuardrailPhase] {
        &[
            GuardrailPhase::PreModel,
            GuardrailPhase::PostTool,
            GuardrailPhase::PreResponse,
        ]
    }

    /// 结构化输入只改写字符串叶子，不在序列化后的 JSON 文本上替换
    fn check(&self, input: &GuardrailInput<'_>, policy: &GuardrailPolicy) -> GuardrailVerdict {
        let redacted = match input.value {
            Some(value) => policy.redact_value(value).map(GuardrailVerdict::RedactValue),
            None => policy.redact_text(input.content).map(GuardrailVerdict::Redact),
        };
        redacted.unwrap_or(GuardrailVerdict::Allow)
    }
}

pub struct PriceCeiling;

impl PriceCeiling {
    /// 显式金额优先，否则用已知单价 × 数量
    fn amount(args: &Value, facts: &TurnFacts) -> Option<f64> {
        if let Some(explicit) = ["total", "amount", "price"]
            .iter()
            .find_map(|k| args.get(*k).and_then(Value::as_f64))
        {
            return Some(explicit);
        }
        let sku = args.get("sku").and_then(Value::as_str)?;
        let unit = facts.price_of(sku)?;
        let quantity = args.get("quantity").and_then(Value::as_f64).unwrap_or(1.0);
        Some(unit * quantity)
    }
}

impl GuardrailCheck for PriceCeiling {
    fn name(&self) -> &'static str {
        "price_ceiling"
    }

    fn phases(&self) -> &'static [GuardrailPhase] {
        &[GuardrailPhase::PreTool]
    }

    fn check(&self, input: &GuardrailInput<'_>, policy: &GuardrailPolicy) -> GuardrailVerdict {
        let (Some(ceiling), Some(tool), Some(args)) = (policy.price_ceiling, input.tool, input.value) else {
            return GuardrailVerdict::Allow;
        };
        if !policy.priced_tools.contains(tool) {
            return GuardrailVerdict::Allow;
        }
        match Self::amount(args, input.facts) {
            Some(amount) if amount > ceiling => GuardrailVerdict::block(
                ReasonCode::PriceCeilingExceeded,
                format!("amount {:.2} exceeds the price ceiling of {:.2}", amount, ceiling),
            ),
            _ => GuardrailVerdict::Allow,
        }
    }
}

pub struct Relevance;

impl GuardrailCheck for Relevance {
    fn name(&self) -> &'static str {
        "relevance"
    }

    fn phases(&self) -> &'static [GuardrailPhase] {
        &[GuardrailPhase::PostTool]
    }

    fn check(&self, input: &GuardrailInput<'_>, policy: &GuardrailPolicy) -> GuardrailVerdict {
        let (Some(min_score), Some(payload)) = (policy.relevance_min_score, input.value) else {
            return GuardrailVerdict::Allow;
        };
        if !payload.get("passages").is_some_and(Value::is_array) {
            return GuardrailVerdict::Allow;
        }
        match extract_facts(payload).max_passage_score() {
            Some(score) if score >= min_score => GuardrailVerdict::Allow,
            Some(score) => GuardrailVerdict::block(
                ReasonCode::LowConfidence,
                format!("best passage score {:.2} is below {:.2}; need more information", score, min_score),
            ),
            None => GuardrailVerdict::block(
                ReasonCode::LowConfidence,
                "no relevant passages were retrieved; need more information",
            ),
        }
    }
}

pub struct Citations;

impl GuardrailCheck for Citations {
    fn name(&self) -> &'static str {
        "citations"
    }

    fn phases(&self) -> &'static [GuardrailPhase] {
        &[GuardrailPhase::PreResponse]
    }

    fn check(&self, input: &GuardrailInput<'_>, policy: &GuardrailPolicy) -> GuardrailVerdict {
        if !policy.require_citations || input.facts.passages.is_empty() {
            return GuardrailVerdict::Allow;
        }
        let cited = input
            .facts
            .passages
            .iter()
            .any(|p| input.content.contains(&format!("[{}]", p.id)));
        if cited {
            GuardrailVerdict::Allow
        } else {
            GuardrailVerdict::block(
                ReasonCode::MissingCitation,
                "answer must cite at least one retrieved passage as [id]",
            )
        }
    }
}

pub struct SkuExistence;

impl GuardrailCheck for SkuExistence {
    fn name(&self) -> &'static str {
        "sku_existence"
    }

    fn phases(&self) -> &'static [GuardrailPhase] {
        &[GuardrailPhase::PreResponse]
    }

    fn check(&self, input: &GuardrailInput<'_>, policy: &GuardrailPolicy) -> GuardrailVerdict {
        let unknown: Vec<&str> = policy
            .sku_pattern
            .find_iter(input.content)
            .map(|m| m.as_str())
            .filter(|sku| !input.facts.known_skus.contains(*sku))
            .collect();
        if unknown.is_empty() {
            GuardrailVerdict::Allow
        } else {
            GuardrailVerdict::block(
                ReasonCode::UnknownSku,
                format!("answer mentions SKUs not seen in tool results: {}", unknown.join(", ")),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardrailsConfig;
    use crate::guardrails::facts::extract_facts;
    use proptest::prelude::*;
    use serde_json::json;

    fn policy(f: impl FnOnce(&mut GuardrailsConfig)) -> GuardrailPolicy {
        let mut cfg = GuardrailsConfig::default();
        f(&mut cfg);
        GuardrailPolicy::from_config(&cfg).unwrap()
    }

    #[test]
    fn test_max_length_uses_phase_limit() {
        let p = policy(|c| {
            c.max_input_chars = 5;
            c.max_output_chars = 10;
        });
        let facts = TurnFacts::new();
        let input = GuardrailInput::new(GuardrailPhase::PreModel, "abcdefg", &facts);
        assert!(MaxLength.check(&input, &p).is_block());
        let output = GuardrailInput::new(GuardrailPhase::PreResponse, "abcdefg", &facts);
        assert_eq!(MaxLength.check(&output, &p), GuardrailVerdict::Allow);
    }

    #[test]
    fn test_pii_is_redacted() {
        let p = policy(|_| {});
        let facts = TurnFacts::new();
        let input = GuardrailInput::new(GuardrailPhase::PreModel, "mail me at bob@example.com", &facts);
        match PiiRedaction.check(&input, &p) {
            GuardrailVerdict::Redact(text) => assert_eq!(text, "mail me at [REDACTED]"),
            other => panic!("expected redact, got {:?}", other),
        }
    }

    #[test]
    fn test_pii_in_payload_keeps_numbers() {
        let p = policy(|_| {});
        let facts = TurnFacts::new();
        let payload = json!({"sku": "SKU-KETTLE1", "price": 39.99, "updated_at_ms": 1700000000000u64});
        let text = payload.to_string();
        let input = GuardrailInput::new(GuardrailPhase::PostTool, &text, &facts).with_tool("catalog_search", &payload);
        assert_eq!(PiiRedaction.check(&input, &p), GuardrailVerdict::Allow);

        let payload = json!({"sku": "SKU-KETTLE1", "seller": "ops@example.com", "updated_at_ms": 1700000000000u64});
        let text = payload.to_string();
        let input = GuardrailInput::new(GuardrailPhase::PostTool, &text, &facts).with_tool("catalog_search", &payload);
        match PiiRedaction.check(&input, &p) {
            GuardrailVerdict::RedactValue(v) => {
                assert_eq!(v["seller"], "[REDACTED]");
                assert_eq!(v["updated_at_ms"], 1700000000000u64);
            }
            other => panic!("expected structured redact, got {:?}", other),
        }
    }

    #[test]
    fn test_price_ceiling_from_known_price_and_quantity() {
        let p = policy(|c| c.price_ceiling = Some(100.0));
        let facts = extract_facts(&json!({"sku": "SKU-9", "price": 40.0}));
        let args = json!({"sku": "SKU-9", "quantity": 3});
        let input = GuardrailInput::new(GuardrailPhase::PreTool, "", &facts).with_tool("cart_add", &args);
        match PriceCeiling.check(&input, &p) {
            GuardrailVerdict::Block { code, .. } => assert_eq!(code, ReasonCode::PriceCeilingExceeded),
            other => panic!("expected block, got {:?}", other),
        }

        let args = json!({"sku": "SKU-9", "quantity": 3});
        let input = GuardrailInput::new(GuardrailPhase::PreTool, "", &facts).with_tool("catalog_search", &args);
        assert_eq!(PriceCeiling.check(&input, &p), GuardrailVerdict::Allow);
    }

    #[test]
    fn test_relevance_blocks_low_scores() {
        let p = policy(|c| c.relevance_min_score = Some(0.5));
        let facts = TurnFacts::new();
        let low = json!({"passages": [{"id": "a", "score": 0.2}, {"id": "b", "score": 0.3}]});
        let input = GuardrailInput::new(GuardrailPhase::PostTool, "", &facts).with_tool("rag_search", &low);
        assert!(matches!(
            Relevance.check(&input, &p),
            GuardrailVerdict::Block { code: ReasonCode::LowConfidence, .. }
        ));

        let high = json!({"passages": [{"id": "a", "score": 0.8}]});
        let input = GuardrailInput::new(GuardrailPhase::PostTool, "", &facts).with_tool("rag_search", &high);
        assert_eq!(Relevance.check(&input, &p), GuardrailVerdict::Allow);
    }

    #[test]
    fn test_citations_and_sku_existence() {
        let p = policy(|c| c.require_citations = true);
        let facts = extract_facts(&json!({
            "sku": "SKU-1",
            "passages": [{"id": "doc-3", "score": 0.9}]
        }));

        let cited = GuardrailInput::new(GuardrailPhase::PreResponse, "SKU-1 fits [doc-3]", &facts);
        assert_eq!(Citations.check(&cited, &p), GuardrailVerdict::Allow);
        assert_eq!(SkuExistence.check(&cited, &p), GuardrailVerdict::Allow);

        let uncited = GuardrailInput::new(GuardrailPhase::PreResponse, "Try SKU-77", &facts);
        assert!(Citations.check(&uncited, &p).is_block());
        assert!(matches!(
            SkuExistence.check(&uncited, &p),
            GuardrailVerdict::Block { code: ReasonCode::UnknownSku, .. }
        ));
    }

    proptest! {
        #[test]
        fn prop_blocklisted_term_is_never_allowed(
            term in "[a-z]{3,8}",
            prefix in "[a-zA-Z0-9 ]{0,20}",
            suffix in "[a-zA-Z0-9 ]{0,20}",
            upper in any::<bool>(),
        ) {
            let p = policy(|c| c.blocklist_terms = vec![term.clone()]);
            let facts = TurnFacts::new();
            let shown = if upper { term.to_uppercase() } else { term.clone() };
            let content = format!("{}{}{}", prefix, shown, suffix);
            for phase in ALL_PHASES {
                let input = GuardrailInput::new(*phase, &content, &facts);
                prop_assert!(Blocklist.check(&input, &p).is_block());
            }
        }
    }
}
