//! 指令文本：每次模型调用前由 (会话状态, 策略配置, 可用工具) 重新计算，不修改任何共享文本

use std::fmt::Write as _;

use crate::approval::ApprovalMode;
use crate::config::{GuardrailsConfig, SpecialistConfig};
use crate::core::SessionState;
use crate::llm::ToolDescriptor;
use crate::rules::{Intent, GENERAL_INTENT};
use crate::tools::tool_call_schema_json;

pub struct PromptContext<'a> {
    pub base: &'a str,
    pub state: SessionState,
    pub step: usize,
    pub max_steps: usize,
    /// 本轮已发生的校验失败次数
    pub corrections: usize,
    pub guardrails: &'a GuardrailsConfig,
    pub approval_mode: ApprovalMode,
    pub tools: &'a [ToolDescriptor],
    pub dangerous: &'a [String],
    /// 为空表示不可委派
    pub specialists: &'a [SpecialistConfig],
    pub intent: Option<&'a Intent>,
    /// 规则引擎为本轮追加的指令
    pub rule_instructions: &'a [String],
    /// 规则要求本轮每个工具调用都先审批
    pub require_approval: bool,
    /// 长期记忆中的用户资料
    pub user_facts: &'a [(String, String)],
}

pub fn build_instructions(ctx: &PromptContext<'_>) -> String {
    let mut out = String::new();
    out.push_str(ctx.base.trim());
    out.push_str("\n\n");

    let _ = writeln!(
        out,
        "Session state: {}. Planning step {} of {}.",
        ctx.state, ctx.step, ctx.max_steps
    );
    if let Some(intent) = ctx.intent.filter(|i| i.name != GENERAL_INTENT) {
        let _ = writeln!(out, "Detected intent: {} (confidence {:.2}).", intent.name, intent.confidence);
    }
    if ctx.corrections > 0 {
        let _ = writeln!(
            out,
            "Your previous attempt failed verification {} time(s); follow the correction notes in the conversation.",
            ctx.corrections
        );
    }

    out.push_str("\nPolicy:\n");
    if let Some(ceiling) = ctx.guardrails.price_ceiling {
        let _ = writeln!(out, "- Purchases above {:.2} are blocked; explain the limit instead.", ceiling);
    }
    if ctx.guardrails.require_citations {
        out.push_str("- Cite retrieved passages as [id] when you use them.\n");
    }
    out.push_str("- Only mention SKUs that appeared in tool results.\n");
    if !ctx.dangerous.is_empty() {
        let _ = writeln!(
            out,
            "- These tools need human approval ({} mode): {}.",
            match ctx.approval_mode {
                ApprovalMode::Auto => "auto",
                ApprovalMode::Manual => "manual",
            },
            ctx.dangerous.join(", ")
        );
    }
    if ctx.require_approval {
        out.push_str("- Every tool call in this turn needs human approval.\n");
    }
    for instruction in ctx.rule_instructions {
        let _ = writeln!(out, "- {}", instruction);
    }

    if !ctx.user_facts.is_empty() {
        let facts: Vec<String> = ctx.user_facts.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let _ = writeln!(out, "\nKnown user details: {}", facts.join(", "));
    }

    if ctx.tools.is_empty() {
        out.push_str("\nNo tools are available; answer directly.\n");
    } else {
        out.push_str("\nTools:\n");
        for tool in ctx.tools {
            let _ = writeln!(out, "- {}: {} {}", tool.name, tool.description, tool.parameters);
        }
    }

    if !ctx.specialists.is_empty() {
        out.push_str("\nSpecialists (use tool \"delegate\" with \"specialist\" and args {\"task\": ...}):\n");
        for s in ctx.specialists {
            let _ = writeln!(out, "- {}: {}", s.name, s.description);
        }
    }

    out.push_str("\nTo act, reply with JSON matching this schema; independent calls may be listed together:\n");
    out.push_str(&tool_call_schema_json());
    out.push_str("\nTo answer the user, reply with plain text.\n");
    out
}
