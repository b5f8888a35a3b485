//! Recorder：会话级记录器，把 Run 归入当前 Trace，轮次结束时提交 Trace
//!
//! 被同一轮内并发的工具步骤共享，内部用互斥锁；sink 报错只记日志。

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core::ReasonCode;
use crate::observability::{Feedback, ObservabilitySink, Run, RunBuilder, RunOutcome, Trace};

struct Current {
    trace_id: Uuid,
    started_at: DateTime<Utc>,
    runs: Vec<Run>,
}

pub struct Recorder {
    sink: Arc<dyn ObservabilitySink>,
    thread_id: String,
    current: Mutex<Current>,
}

impl Recorder {
    pub fn new(sink: Arc<dyn ObservabilitySink>, thread_id: impl Into<String>) -> Self {
        Self {
            sink,
            thread_id: thread_id.into(),
            current: Mutex::new(Current {
                trace_id: Uuid::new_v4(),
                started_at: Utc::now(),
                runs: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Current> {
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn sink(&self) -> &Arc<dyn ObservabilitySink> {
        &self.sink
    }

    pub fn trace_id(&self) -> Uuid {
        self.lock().trace_id
    }

    /// 开始新的一轮（丢弃未提交的 Run）
    pub fn begin_trace(&self) -> Uuid {
        let mut current = self.lock();
        current.trace_id = Uuid::new_v4();
        current.started_at = Utc::now();
        current.runs.clear();
        current.trace_id
    }

    /// 完成一个 Run 并提交
    pub fn finish(&self, builder: RunBuilder, outcome: RunOutcome) -> Uuid {
        let run = {
            let mut current = self.lock();
            let run = builder.finish(current.trace_id, &self.thread_id, outcome);
            current.runs.push(run.clone());
            run
        };
        if let Err(e) = self.sink.record_run(&run) {
            tracing::warn!(run_id = %run.id, error = %e, "failed to record run");
        }
        run.id
    }

    /// 提交当前 Trace
    pub fn finish_trace(&self, status: &str, reason: Option<ReasonCode>) -> Trace {
        let trace = {
            let mut current = self.lock();
            Trace {
                id: current.trace_id,
                thread_id: self.thread_id.clone(),
                runs: std::mem::take(&mut current.runs),
                started_at: current.started_at,
                finished_at: Utc::now(),
                status: status.to_string(),
                reason,
            }
        };
        if let Err(e) = self.sink.record_trace(&trace) {
            tracing::warn!(trace_id = %trace.id, error = %e, "failed to record trace");
        }
        trace
    }

    pub fn feedback(&self, feedback: Feedback) {
        if let Err(e) = self.sink.record_feedback(&feedback) {
            tracing::warn!(run_id = %feedback.run_id, error = %e, "failed to record feedback");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::{InMemorySink, ObservabilitySink, RunKind, SinkError};

    struct FailingSink;

    impl ObservabilitySink for FailingSink {
        fn record_run(&self, _run: &Run) -> Result<(), SinkError> {
            Err(SinkError::Unavailable("down".into()))
        }
        fn record_trace(&self, _trace: &Trace) -> Result<(), SinkError> {
            Err(SinkError::Unavailable("down".into()))
        }
        fn record_feedback(&self, _feedback: &Feedback) -> Result<(), SinkError> {
            Err(SinkError::Unavailable("down".into()))
        }
    }

    #[test]
    fn test_runs_grouped_into_trace_and_thread() {
        let sink = InMemorySink::new();
        let rec = Recorder::new(Arc::new(sink.clone()), "s1");
        rec.begin_trace();
        let model = rec.finish(RunBuilder::start(RunKind::Model, "plan"), RunOutcome::Success);
        rec.finish(
            RunBuilder::start(RunKind::Tool, "search"),
            RunOutcome::Failure {
                code: ReasonCode::RateLimited,
                message: "limit".into(),
            },
        );
        let trace = rec.finish_trace("done", None);
        assert_eq!(trace.runs.len(), 2);
        assert_eq!(trace.runs[0].id, model);

        rec.feedback(Feedback::tag(model, "helpful"));
        assert_eq!(sink.run(model).unwrap().tags, vec!["helpful".to_string()]);
        assert_eq!(sink.thread("s1").traces.len(), 1);
    }

    #[test]
    fn test_failing_sink_does_not_panic() {
        let rec = Recorder::new(Arc::new(FailingSink), "s1");
        let id = rec.finish(RunBuilder::start(RunKind::Tool, "x"), RunOutcome::Success);
        rec.feedback(Feedback::score(id, 1.0));
        let trace = rec.finish_trace("done", None);
        assert_eq!(trace.runs.len(), 1);
    }
}
