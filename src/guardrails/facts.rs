//! 会话事实：从工具结果中抽取检索片段、已见 SKU 与价格，供护栏检查使用
//!
//! 抽取是纯函数；检查只读取显式传入的 TurnFacts，不依赖任何全局状态。

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

/// 检索片段（只保留检查需要的字段）
#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    pub id: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnFacts {
    /// 本轮检索到的片段；每轮开始时清空
    pub passages: Vec<Passage>,
    /// 会话内工具结果中出现过的 SKU
    pub known_skus: BTreeSet<String>,
    /// SKU -> 单价
    pub prices: BTreeMap<String, f64>,
}

impl TurnFacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新一轮开始：检索片段只对当前轮有效，SKU 与价格保留
    pub fn begin_turn(&mut self) {
        self.passages.clear();
    }

    /// 合并一个工具结果载荷中的事实
    pub fn absorb(&mut self, payload: &Value) {
        let extracted = extract_facts(payload);
        self.passages.extend(extracted.passages);
        self.known_skus.extend(extracted.known_skus);
        self.prices.extend(extracted.prices);
    }

    pub fn max_passage_score(&self) -> Option<f64> {
        self.passages.iter().map(|p| p.score).reduce(f64::max)
    }

    pub fn price_of(&self, sku: &str) -> Option<f64> {
        self.prices.get(sku).copied()
    }
}

/// 从单个载荷中抽取事实
///
/// - 任意层级 `"passages": [{id, score, ..}]` 视为检索片段
/// - 任意对象的 `"sku"` 字符串字段视为已见 SKU；同一对象的数值 `"price"` 记为其单价
pub fn extract_facts(payload: &Value) -> TurnFacts {
    let mut facts = TurnFacts::default();
    walk(payload, &mut facts);
    facts
}

fn walk(value: &Value, facts: &mut TurnFacts) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(sku)) = map.get("sku") {
                facts.known_skus.insert(sku.clone());
                if let Some(price) = map.get("price").and_then(Value::as_f64) {
                    facts.prices.insert(sku.clone(), price);
                }
            }
            if let Some(Value::Array(passages)) = map.get("passages") {
                facts.passages.extend(passages.iter().filter_map(parse_passage));
            }
            for (key, child) in map {
                if key != "passages" {
                    walk(child, facts);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| walk(item, facts)),
        _ => {}
    }
}

fn parse_passage(value: &Value) -> Option<Passage> {
    let id = match value.get("id")? {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let score = value.get("score").and_then(Value::as_f64).unwrap_or(0.0);
    Some(Passage { id, score })
}
