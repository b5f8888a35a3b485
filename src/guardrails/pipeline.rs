//! 护栏流水线：按顺序评估适用于当前阶段的检查，遇到第一个 block 即短路
//!
//! redact 替换内容并继续，后续检查看到的是替换后的内容。每次评估的全部结论作为一个 Guardrail Run 记录。
//! 结构化输入（工具参数、工具载荷）的脱敏结果保存在 `value` 中；文本替换若使载荷不再是合法 JSON，按拦截处理。

use serde_json::{json, Value};

use crate::config::GuardrailsConfig;
use crate::core::{AgentError, ReasonCode, ToolFailure};
use crate::guardrails::checks::{default_checks, GuardrailCheck, GuardrailInput, GuardrailPhase, GuardrailVerdict};
use crate::guardrails::policy::GuardrailPolicy;
use crate::observability::{Recorder, RunBuilder, RunKind, RunOutcome, VerdictRecord};

/// 拦截信息
#[derive(Debug, Clone, PartialEq)]
pub struct BlockedBy {
    pub check: String,
    pub code: ReasonCode,
    pub reason: String,
}

impl BlockedBy {
    pub fn to_failure(&self) -> ToolFailure {
        ToolFailure::GuardrailBlocked {
            check: self.check.clone(),
            code: self.code,
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    /// 最终内容（可能已脱敏）
    pub content: String,
    /// 脱敏后的结构化值；仅当输入带结构化值且被改写时为 Some
    pub value: Option<Value>,
    pub redacted: bool,
    pub blocked: Option<BlockedBy>,
    pub verdicts: Vec<VerdictRecord>,
}

impl PipelineOutcome {
    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }
}

pub struct GuardrailPipeline {
    policy: GuardrailPolicy,
    checks: Vec<Box<dyn GuardrailCheck>>,
}

impl GuardrailPipeline {
    pub fn new(policy: GuardrailPolicy) -> Self {
        Self::with_checks(policy, default_checks())
    }

    pub fn with_checks(policy: GuardrailPolicy, checks: Vec<Box<dyn GuardrailCheck>>) -> Self {
        Self { policy, checks }
    }

    pub fn from_config(cfg: &GuardrailsConfig) -> Result<Self, AgentError> {
        Ok(Self::new(GuardrailPolicy::from_config(cfg)?))
    }

    pub fn policy(&self) -> &GuardrailPolicy {
        &self.policy
    }

    pub fn evaluate(&self, input: GuardrailInput<'_>) -> PipelineOutcome {
        let mut content = input.content.to_string();
        let mut value: Option<Value> = None;
        let mut redacted = false;
        let mut verdicts = Vec::new();

        for check in self.checks.iter().filter(|c| c.applies_to(input.phase)) {
            let current = GuardrailInput {
                phase: input.phase,
                content: &content,
                tool: input.tool,
                value: value.as_ref().or(input.value),
                facts: input.facts,
            };
            let mut verdict = check.check(&current, &self.policy);
            if let (GuardrailVerdict::Redact(text), Some(_)) = (&verdict, input.value) {
                verdict = match serde_json::from_str::<Value>(text) {
                    Ok(parsed) => GuardrailVerdict::RedactValue(parsed),
                    Err(_) => GuardrailVerdict::block(
                        ReasonCode::GuardrailBlocked,
                        "redaction produced an invalid payload",
                    ),
                };
            }
            let reason = match &verdict {
                GuardrailVerdict::Block { reason, .. } => Some(reason.clone()),
                _ => None,
            };
            verdicts.push(VerdictRecord {
                check: check.name().to_string(),
                phase: input.phase.as_str().to_string(),
                verdict: verdict.label().to_string(),
                reason,
            });

            match verdict {
                GuardrailVerdict::Allow => {}
                GuardrailVerdict::Redact(replaced) => {
                    content = replaced;
                    redacted = true;
                }
                GuardrailVerdict::RedactValue(replaced) => {
                    content = replaced.to_string();
                    value = Some(replaced);
                    redacted = true;
                }
                GuardrailVerdict::Block { reason, code } => {
                    tracing::info!(
                        check = check.name(),
                        phase = %input.phase,
                        tool = input.tool.unwrap_or("-"),
                        code = %code,
                        "guardrail blocked"
                    );
                    return PipelineOutcome {
                        content,
                        value,
                        redacted,
                        blocked: Some(BlockedBy {
                            check: check.name().to_string(),
                            code,
                            reason,
                        }),
                        verdicts,
                    };
                }
            }
        }

        PipelineOutcome {
            content,
            value,
            redacted,
            blocked: None,
            verdicts,
        }
    }

    /// 评估并把结论作为 Guardrail Run 记录
    pub fn evaluate_recorded(&self, input: GuardrailInput<'_>, recorder: &Recorder) -> PipelineOutcome {
        let phase = input.phase;
        let tool = input.tool.map(str::to_string);
        let outcome = self.evaluate(input);
        let run_outcome = match &outcome.blocked {
            Some(b) => RunOutcome::Failure {
                code: b.code,
                message: format!("{}: {}", b.check, b.reason),
            },
            None => RunOutcome::Success,
        };
        let builder = RunBuilder::start(RunKind::Guardrail, format!("guardrails:{}", phase))
            .verdicts(outcome.verdicts.clone())
            .metadata(json!({ "tool": tool, "redacted": outcome.redacted }));
        recorder.finish(builder, run_outcome);
        outcome
    }
}
