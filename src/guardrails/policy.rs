//! 编译后的护栏策略：由 GuardrailsConfig 构造一次，正则错误视为配置错误

use std::collections::HashSet;

use regex::Regex;
use serde_json::Value;

use crate::config::GuardrailsConfig;
use crate::core::AgentError;

/// 脱敏替换文本
pub const REDACTION: &str = "[REDACTED]";

#[derive(Debug, Clone)]
pub struct GuardrailPolicy {
    pub max_input_chars: usize,
    pub max_output_chars: usize,
    /// (原始词, 大小写不敏感的字面量正则)
    pub blocklist: Vec<(String, Regex)>,
    pub pii_patterns: Vec<Regex>,
    pub price_ceiling: Option<f64>,
    pub priced_tools: HashSet<String>,
    pub require_citations: bool,
    pub relevance_min_score: Option<f64>,
    pub sku_pattern: Regex,
}

impl GuardrailPolicy {
    pub fn from_config(cfg: &GuardrailsConfig) -> Result<Self, AgentError> {
        let blocklist = cfg
            .blocklist_terms
            .iter()
            .filter(|t| !t.trim().is_empty())
            .map(|term| {
                let re = compile(&format!("(?i){}", regex::escape(term.trim())))?;
                Ok((term.trim().to_string(), re))
            })
            .collect::<Result<Vec<_>, AgentError>>()?;

        let pii_patterns = cfg
            .pii_patterns
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            max_input_chars: cfg.max_input_chars,
            max_output_chars: cfg.max_output_chars,
            blocklist,
            pii_patterns,
            price_ceiling: cfg.price_ceiling,
            priced_tools: cfg.priced_tools.iter().cloned().collect(),
            require_citations: cfg.require_citations,
            relevance_min_score: cfg.relevance_min_score,
            sku_pattern: compile(&cfg.sku_pattern)?,
        })
    }
}

impl GuardrailPolicy {
    /// 对一段文本应用全部 PII 正则；无匹配返回 None
    pub fn redact_text(&self, text: &str) -> Option<String> {
        let mut out: Option<String> = None;
        for re in &self.pii_patterns {
            let current = out.as_deref().unwrap_or(text);
            if re.is_match(current) {
                out = Some(re.replace_all(current, REDACTION).into_owned());
            }
        }
        out
    }

    /// 只改写字符串叶子，数字、布尔与键名保持原样，结果仍是合法 JSON；无匹配返回 None
    pub fn redact_value(&self, value: &Value) -> Option<Value> {
        match value {
            Value::String(s) => self.redact_text(s).map(Value::String),
            Value::Array(items) => {
                let redacted: Vec<Option<Value>> = items.iter().map(|v| self.redact_value(v)).collect();
                if redacted.iter().all(Option::is_none) {
                    return None;
                }
                Some(Value::Array(
                    items
                        .iter()
                        .zip(redacted)
                        .map(|(orig, r)| r.unwrap_or_else(|| orig.clone()))
                        .collect(),
                ))
            }
            Value::Object(map) => {
                let mut changed = false;
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    match self.redact_value(v) {
                        Some(r) => {
                            changed = true;
                            out.insert(k.clone(), r);
                        }
                        None => {
                            out.insert(k.clone(), v.clone());
                        }
                    }
                }
                changed.then_some(Value::Object(out))
            }
            _ => None,
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, AgentError> {
    Regex::new(pattern).map_err(|e| AgentError::ConfigError(format!("invalid guardrail regex '{}': {}", pattern, e)))
}
