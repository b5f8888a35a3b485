//! 电商规则集：订单查询、退款、商品搜索、改地址

use crate::rules::{IntentMatchRule, KeywordIntentClassifier, RuleDecision, RulesEngine};

pub const COMMERCE_KEYWORDS: &[(&str, &[&str])] = &[
    ("order_status", &["track", "tracking", "order status", "where is my order"]),
    ("refund_request", &["refund", "chargeback", "return", "money back"]),
    ("product_search", &["find", "search", "recommend", "looking for"]),
    ("address_change", &["change address", "update address", "shipping address"]),
];

pub fn classifier() -> KeywordIntentClassifier {
    COMMERCE_KEYWORDS
        .iter()
        .fold(KeywordIntentClassifier::new(), |c, (intent, keywords)| {
            c.intent(*intent, keywords.iter().copied())
        })
}

pub fn engine() -> RulesEngine {
    RulesEngine::new(classifier())
        .rule(IntentMatchRule::new(
            "refund_request",
            RuleDecision::default()
                .require_approval()
                .note("Refunds require human approval before responding.")
                .instruction("Do not promise refunds or reversals without approval.")
                .instruction("Collect order ID and reason only."),
        ))
        .rule(IntentMatchRule::new(
            "address_change",
            RuleDecision::default()
                .require_approval()
                .note("Address changes require verification and approval.")
                .instruction("Verify identity before confirming address updates."),
        ))
        .rule(IntentMatchRule::new(
            "order_status",
            RuleDecision::default()
                .note("Prefer internal order systems for status.")
                .instruction("Use internal order status tools when available."),
        ))
        .rule(IntentMatchRule::new(
            "product_search",
            RuleDecision::default()
                .note("Recommend products with clear disclaimers on availability.")
                .instruction("Avoid guaranteeing inventory or delivery dates."),
        ))
}
