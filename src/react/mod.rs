//! 认知层：Planner（模型调用与计划解析）、指令文本构建、单轮编排循环

pub mod loop_;
pub mod planner;
pub mod prompt;

pub use loop_::{run_turn, TurnOptions, TurnOutcome, TurnStatus};
pub use planner::{parse_reply, Plan, PlanStep, Planner, DELEGATE_TOOL};
pub use prompt::{build_instructions, PromptContext};
