//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / schema / invoke），由 ToolRegistry 按名注册与查找。
//! 注册表是静态查找表：启动时注册，运行中只读。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::llm::ToolDescriptor;
use crate::tools::ToolSchema;

/// 工具后端返回的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    /// 超时、5xx 一类，可重试
    #[error("transient failure: {0}")]
    Transient(String),

    /// 参数/校验类错误，不重试
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// 后端明确拒绝，不重试
    #[error("rejected: {0}")]
    Rejected(String),
}

impl ToolError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::Transient(_))
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、是否危险、异步调用（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于调用中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 schema；默认不声明字段
    fn schema(&self) -> ToolSchema {
        ToolSchema::new()
    }

    /// 危险操作（下单、支付、破坏性写入）需要人工审批
    fn dangerous(&self) -> bool {
        false
    }

    /// 风险类别，审批策略按类别决定是否自动放行
    fn risk_category(&self) -> &str {
        "general"
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>，遍历顺序按名称排序
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous adapter replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 供模型使用的工具描述；allowed 非空时只返回其中的工具
    pub fn descriptors(&self, allowed: Option<&[String]>) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .filter(|(name, _)| allowed.map_or(true, |a| a.iter().any(|n| n == *name)))
            .map(|(name, tool)| ToolDescriptor {
                name: name.clone(),
                description: tool.description().to_string(),
                parameters: tool.schema().to_json_schema(),
            })
            .collect()
    }

    /// 工具描述 JSON，用于指令文本中的 Available tools 段落
    pub fn to_schema_json(&self, allowed: Option<&[String]>) -> String {
        serde_json::to_string_pretty(&self.descriptors(allowed)).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::FieldSpec;
    use serde_json::json;

    struct Inventory;

    #[async_trait]
    impl Tool for Inventory {
        fn name(&self) -> &str {
            "inventory_check"
        }
        fn description(&self) -> &str {
            "Check stock for a SKU"
        }
        fn schema(&self) -> ToolSchema {
            ToolSchema::new().field(FieldSpec::string("sku").required())
        }
        async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
            Ok(json!({"sku": args["sku"], "stock": 3}))
        }
    }

    #[tokio::test]
    async fn test_register_and_describe() {
        let mut registry = ToolRegistry::new();
        registry.register(Inventory);
        assert!(registry.contains("inventory_check"));
        let tool = registry.get("inventory_check").unwrap();
        assert!(!tool.dangerous());
        assert_eq!(tool.risk_category(), "general");
        assert_eq!(tool.invoke(json!({"sku": "SKU-1"})).await.unwrap()["stock"], 3);

        let all = registry.descriptors(None);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].parameters["required"], json!(["sku"]));
        let none = registry.descriptors(Some(&["checkout".to_string()]));
        assert!(none.is_empty());
        assert!(registry.to_schema_json(None).contains("inventory_check"));
    }
}
