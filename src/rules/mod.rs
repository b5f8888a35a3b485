//! 规则引擎：关键词意图分类 + 按意图给出策略决定
//!
//! 每轮开始时对用户输入分类一次，所有规则的决定合并为一个 RuleDecision：
//! allow 取与、require_approval 取或、说明与指令累加、allowed_tools 取交集。
//! 决定作用于本轮的 TurnOptions 与提示词，不改写用户输入。

pub mod commerce;

use serde::Serialize;

use crate::config::{RuleSpec, RulesSection};

/// 未命中任何关键词时的意图
pub const GENERAL_INTENT: &str = "general";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Intent {
    pub name: String,
    /// 0.0 - 1.0，命中 3 个关键词即为 1.0
    pub confidence: f64,
}

impl Intent {
    pub fn general() -> Self {
        Self {
            name: GENERAL_INTENT.to_string(),
            confidence: 0.0,
        }
    }
}

/// 关键词计数分类：命中最多者胜出，平局取先声明的意图
#[derive(Debug, Clone, Default)]
pub struct KeywordIntentClassifier {
    intents: Vec<(String, Vec<String>)>,
}

impl KeywordIntentClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intent<S: Into<String>>(mut self, name: impl Into<String>, keywords: impl IntoIterator<Item = S>) -> Self {
        let keywords = keywords.into_iter().map(|k| k.into().to_lowercase()).collect();
        self.intents.push((name.into(), keywords));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    pub fn classify(&self, text: &str) -> Intent {
        let text = text.to_lowercase();
        let mut best: Option<(&str, usize)> = None;
        for (name, keywords) in &self.intents {
            let score = keywords.iter().filter(|k| text.contains(k.as_str())).count();
            if score > 0 && best.map_or(true, |(_, top)| score > top) {
                best = Some((name.as_str(), score));
            }
        }
        match best {
            Some((name, score)) => Intent {
                name: name.to_string(),
                confidence: (score as f64 / 3.0).min(1.0),
            },
            None => Intent::general(),
        }
    }
}

/// 规则的决定；默认放行、无附加约束
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleDecision {
    pub allow: bool,
    pub require_approval: bool,
    pub notes: Vec<String>,
    pub system_instructions: Vec<String>,
    /// None 表示不收窄工具集
    pub allowed_tools: Option<Vec<String>>,
}

impl Default for RuleDecision {
    fn default() -> Self {
        Self {
            allow: true,
            require_approval: false,
            notes: Vec::new(),
            system_instructions: Vec::new(),
            allowed_tools: None,
        }
    }
}

impl RuleDecision {
    pub fn require_approval(mut self) -> Self {
        self.require_approval = true;
        self
    }

    pub fn deny(mut self) -> Self {
        self.allow = false;
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instructions.push(instruction.into());
        self
    }

    pub fn tools<S: Into<String>>(mut self, tools: impl IntoIterator<Item = S>) -> Self {
        self.allowed_tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn merge(&mut self, other: RuleDecision) {
        self.allow &= other.allow;
        self.require_approval |= other.require_approval;
        self.notes.extend(other.notes);
        self.system_instructions.extend(other.system_instructions);
        self.allowed_tools = match (self.allowed_tools.take(), other.allowed_tools) {
            (None, update) => update,
            (current, None) => current,
            (Some(current), Some(update)) => Some(current.into_iter().filter(|t| update.contains(t)).collect()),
        };
    }
}

impl From<&RuleSpec> for RuleDecision {
    fn from(rule: &RuleSpec) -> Self {
        Self {
            allow: rule.allow,
            require_approval: rule.require_approval,
            notes: rule.notes.clone(),
            system_instructions: rule.system_instructions.clone(),
            allowed_tools: rule.allowed_tools.clone(),
        }
    }
}

pub struct RuleContext<'a> {
    pub task: &'a str,
    pub intent: &'a Intent,
}

pub trait Rule: Send + Sync {
    fn name(&self) -> &str;

    /// None 表示该规则不适用
    fn evaluate(&self, ctx: &RuleContext<'_>) -> Option<RuleDecision>;
}

/// 意图命中时返回固定决定
#[derive(Debug, Clone)]
pub struct IntentMatchRule {
    name: String,
    intent: String,
    decision: RuleDecision,
}

impl IntentMatchRule {
    pub fn new(intent: impl Into<String>, decision: RuleDecision) -> Self {
        let intent = intent.into();
        Self {
            name: format!("intent:{}", intent),
            intent,
            decision,
        }
    }
}

impl Rule for IntentMatchRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Option<RuleDecision> {
        (ctx.intent.name == self.intent).then(|| self.decision.clone())
    }
}

/// 一次评估的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleEvaluation {
    pub intent: Intent,
    pub decision: RuleDecision,
    /// 命中的规则名
    pub matched: Vec<String>,
}

pub struct RulesEngine {
    classifier: KeywordIntentClassifier,
    rules: Vec<Box<dyn Rule>>,
}

impl RulesEngine {
    pub fn new(classifier: KeywordIntentClassifier) -> Self {
        Self {
            classifier,
            rules: Vec::new(),
        }
    }

    pub fn rule(mut self, rule: impl Rule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    /// 内置规则集在前，[rules] 中的自定义意图与规则追加在后
    pub fn from_config(cfg: &RulesSection) -> Self {
        let mut engine = match cfg.ruleset.as_str() {
            "commerce" => commerce::engine(),
            _ => RulesEngine::new(KeywordIntentClassifier::new()),
        };
        for entry in &cfg.intents {
            engine.classifier = engine.classifier.intent(entry.intent.clone(), entry.keywords.iter().cloned());
        }
        for rule in &cfg.rules {
            engine = engine.rule(IntentMatchRule::new(rule.intent.clone(), RuleDecision::from(rule)));
        }
        tracing::debug!(
            ruleset = %cfg.ruleset,
            intents = engine.classifier.intents.len(),
            rules = engine.rules.len(),
            "rules engine built"
        );
        engine
    }

    pub fn is_empty(&self) -> bool {
        self.classifier.is_empty() && self.rules.is_empty()
    }

    pub fn evaluate(&self, task: &str) -> RuleEvaluation {
        let intent = self.classifier.classify(task);
        let ctx = RuleContext { task, intent: &intent };
        let mut decision = RuleDecision::default();
        let mut matched = Vec::new();
        for rule in &self.rules {
            if let Some(update) = rule.evaluate(&ctx) {
                matched.push(rule.name().to_string());
                decision.merge(update);
            }
        }
        RuleEvaluation {
            intent,
            decision,
            matched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntentKeywords;

    #[test]
    fn test_classifier_counts_keywords_and_keeps_first_on_tie() {
        let classifier = KeywordIntentClassifier::new()
            .intent("order_status", ["track", "where is my order"])
            .intent("refund_request", ["refund", "return"]);

        let intent = classifier.classify("Where is my order? I want to TRACK it");
        assert_eq!(intent.name, "order_status");
        assert!((intent.confidence - 2.0 / 3.0).abs() < 1e-9);

        // 各命中 1 个：先声明的胜出
        assert_eq!(classifier.classify("track or refund").name, "order_status");
        assert_eq!(classifier.classify("hello there"), Intent::general());
    }

    #[test]
    fn test_merge_intersects_tools_and_ors_approval() {
        let mut decision = RuleDecision::default();
        decision.merge(RuleDecision::default().tools(["order_status", "track_shipment", "cart_view"]));
        decision.merge(RuleDecision::default().require_approval().tools(["order_status", "cart_view"]).note("a"));
        decision.merge(RuleDecision::default().instruction("be brief").note("b"));

        assert!(decision.allow);
        assert!(decision.require_approval);
        assert_eq!(decision.allowed_tools, Some(vec!["order_status".to_string(), "cart_view".to_string()]));
        assert_eq!(decision.notes, vec!["a", "b"]);
        assert_eq!(decision.system_instructions, vec!["be brief"]);

        decision.merge(RuleDecision::default().deny());
        assert!(!decision.allow);
    }

    #[test]
    fn test_config_rules_extend_builtin_set() {
        let cfg = RulesSection {
            ruleset: "commerce".into(),
            intents: vec![IntentKeywords {
                intent: "gift_card".into(),
                keywords: vec!["gift card".into()],
            }],
            rules: vec![RuleSpec {
                intent: "gift_card".into(),
                allow: false,
                require_approval: false,
                notes: vec!["Gift cards are sold in store only.".into()],
                system_instructions: Vec::new(),
                allowed_tools: None,
            }],
        };
        let engine = RulesEngine::from_config(&cfg);

        let eval = engine.evaluate("can I buy a gift card online?");
        assert_eq!(eval.intent.name, "gift_card");
        assert!(!eval.decision.allow);
        assert_eq!(eval.matched, vec!["intent:gift_card"]);

        let eval = engine.evaluate("I want a refund for my kettle");
        assert_eq!(eval.intent.name, "refund_request");
        assert!(eval.decision.allow);
        assert!(eval.decision.require_approval);

        assert!(RulesEngine::from_config(&RulesSection::default()).is_empty());
    }
}
