//! Hive - LLM 智能体编排核心
//!
//! 模块划分：
//! - **approval**: 危险工具调用的人工审批门（auto / manual、超时、审计）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话状态机、错误与恢复、运行时构建、会话编排器
//! - **guardrails**: 模型调用与工具调用前后的有序护栏检查
//! - **llm**: LLM 客户端抽象、重试包装与脚本化客户端
//! - **memory**: 会话日志、可插拔记忆后端与上下文压缩
//! - **observability**: tracing 初始化与 Run / Trace / Thread 记录
//! - **react**: Planner、指令文本与单轮编排循环
//! - **rules**: 关键词意图分类与按意图的策略规则
//! - **subagent**: 专家子智能体委派
//! - **tools**: 工具注册表、参数 schema、限流、执行器与路由

pub mod approval;
pub mod config;
pub mod core;
pub mod guardrails;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod rules;
pub mod subagent;
pub mod tools;

pub use crate::config::{load_config, AppConfig};
pub use crate::core::{spawn_session, AgentError, AgentRuntime, Command, Orchestrator, ReasonCode, RuntimeBuilder};
pub use crate::react::{TurnOutcome, TurnStatus};
