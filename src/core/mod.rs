//! 核心编排层：错误与恢复、会话状态机、会话监管、任务调度、运行时构建与会话编排器

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session;
pub mod session_supervisor;
pub mod state;
pub mod task_scheduler;

pub use builder::{AgentRuntime, RuntimeBuilder};
pub use error::{AgentError, ReasonCode, RecoveryAction, ToolFailure};
pub use orchestrator::{spawn_session, Command, Orchestrator};
pub use recovery::RecoveryEngine;
pub use session::Session;
pub use session_supervisor::SessionSupervisor;
pub use state::{SessionSnapshot, SessionState};
pub use task_scheduler::TaskScheduler;
