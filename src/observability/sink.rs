//! 可观测性 sink：接收 Run / Trace / Feedback，对编排核心是 fire-and-forget
//!
//! 记录失败只打 warn 日志，不中断编排。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use uuid::Uuid;

use crate::observability::{Feedback, Run, Thread, Trace};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown run: {0}")]
    UnknownRun(Uuid),
}

pub trait ObservabilitySink: Send + Sync {
    fn record_run(&self, run: &Run) -> Result<(), SinkError>;

    fn record_trace(&self, trace: &Trace) -> Result<(), SinkError>;

    fn record_feedback(&self, feedback: &Feedback) -> Result<(), SinkError>;
}

/// 丢弃一切
#[derive(Debug, Default)]
pub struct NoopSink;

impl ObservabilitySink for NoopSink {
    fn record_run(&self, _run: &Run) -> Result<(), SinkError> {
        Ok(())
    }

    fn record_trace(&self, _trace: &Trace) -> Result<(), SinkError> {
        Ok(())
    }

    fn record_feedback(&self, _feedback: &Feedback) -> Result<(), SinkError> {
        Ok(())
    }
}

/// 以结构化日志输出（tracing 事件，JSON 字段）
#[derive(Debug, Default)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn record_run(&self, run: &Run) -> Result<(), SinkError> {
        let json = serde_json::to_string(run).map_err(|e| SinkError::Unavailable(e.to_string()))?;
        tracing::info!(target: "hive::observability", run = %json, "run");
        Ok(())
    }

    fn record_trace(&self, trace: &Trace) -> Result<(), SinkError> {
        tracing::info!(
            target: "hive::observability",
            trace_id = %trace.id,
            thread = %trace.thread_id,
            runs = trace.runs.len(),
            status = %trace.status,
            reason = trace.reason.map(|r| r.as_str()).unwrap_or("-"),
            "trace"
        );
        Ok(())
    }

    fn record_feedback(&self, feedback: &Feedback) -> Result<(), SinkError> {
        let json = serde_json::to_string(feedback).map_err(|e| SinkError::Unavailable(e.to_string()))?;
        tracing::info!(target: "hive::observability", feedback = %json, "feedback");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Store {
    runs: Vec<Run>,
    threads: HashMap<String, Thread>,
}

/// 内存 sink：测试与调试用，可按会话取回 Thread
#[derive(Debug, Default, Clone)]
pub struct InMemorySink {
    store: Arc<Mutex<Store>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn runs(&self) -> Vec<Run> {
        self.lock().runs.clone()
    }

    pub fn thread(&self, thread_id: &str) -> Thread {
        self.lock()
            .threads
            .get(thread_id)
            .cloned()
            .unwrap_or_else(|| Thread {
                id: thread_id.to_string(),
                traces: Vec::new(),
            })
    }

    pub fn run(&self, id: Uuid) -> Option<Run> {
        self.lock().runs.iter().find(|r| r.id == id).cloned()
    }
}

impl ObservabilitySink for InMemorySink {
    fn record_run(&self, run: &Run) -> Result<(), SinkError> {
        self.lock().runs.push(run.clone());
        Ok(())
    }

    fn record_trace(&self, trace: &Trace) -> Result<(), SinkError> {
        let mut store = self.lock();
        store
            .threads
            .entry(trace.thread_id.clone())
            .or_insert_with(|| Thread {
                id: trace.thread_id.clone(),
                traces: Vec::new(),
            })
            .traces
            .push(trace.clone());
        Ok(())
    }

    fn record_feedback(&self, feedback: &Feedback) -> Result<(), SinkError> {
        let mut store = self.lock();
        let Some(run) = store.runs.iter_mut().find(|r| r.id == feedback.run_id) else {
            return Err(SinkError::UnknownRun(feedback.run_id));
        };
        if let crate::observability::FeedbackValue::Tag(tag) = &feedback.value {
            run.tags.push(tag.clone());
        }
        run.feedback.push(feedback.clone());
        Ok(())
    }
}
