//! 可观测性：tracing 初始化与 Run / Trace / Thread 记录

pub mod recorder;
pub mod sink;
pub mod trace;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use recorder::Recorder;
pub use sink::{InMemorySink, NoopSink, ObservabilitySink, SinkError, TracingSink};
pub use trace::{
    Feedback, FeedbackValue, Run, RunBuilder, RunKind, RunOutcome, Thread, Trace, VerdictRecord,
};

/// 安装全局 subscriber：RUST_LOG 优先，否则使用 default_level；重复调用无副作用
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
