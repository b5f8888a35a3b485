//! 工具执行器
//!
//! 对每次后端调用施加超时；瞬时失败（超时、Transient）按指数退避重试，永久失败不重试。
//! 重试等待与调用本身都响应取消。每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::ToolFailure;
use crate::tools::{Tool, ToolError};

/// 重试策略：最多 max_attempts 次调用，第 n 次重试前等待 base * 2^n（封顶 max_delay）
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(16)).unwrap_or(u32::MAX);
        std::cmp::min(self.base_delay.saturating_mul(factor), self.max_delay)
    }
}

/// 工具执行器：超时 + 重试 + 审计
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    timeout: Duration,
    retry: RetryPolicy,
}

impl ToolExecutor {
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Self {
        Self { timeout, retry }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 调用后端；返回成功载荷或数据化失败
    pub async fn execute(
        &self,
        tool: &Arc<dyn Tool>,
        args: &Value,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, ToolFailure> {
        let start = Instant::now();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempts = 0;

        let result = loop {
            attempts += 1;
            let call = timeout(self.timeout, tool.invoke(args.clone()));
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break Err(ToolFailure::Cancelled),
                r = call => match r {
                    Ok(inner) => inner,
                    Err(_) => Err(ToolError::Transient(format!(
                        "timed out after {} ms",
                        self.timeout.as_millis()
                    ))),
                },
            };

            match outcome {
                Ok(payload) => break Ok(payload),
                Err(e) if e.is_transient() && attempts < max_attempts => {
                    let delay = self.retry.delay_for(attempts - 1);
                    tracing::warn!(
                        tool = %tool.name(),
                        session = %session_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient tool failure, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break Err(ToolFailure::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    break Err(ToolFailure::Backend {
                        transient: e.is_transient(),
                        message: e.to_string(),
                    })
                }
            }
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(ToolFailure::Cancelled) => "cancelled",
            Err(ToolFailure::Backend { transient: true, .. }) => "transient_error",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool.name(),
            "session": session_id,
            "ok": result.is_ok(),
            "outcome": outcome,
            "attempts": attempts,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(args),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
        error: ToolError,
    }

    #[async_trait]
    impl Tool for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "fails a few times"
        }
        async fn invoke(&self, _args: Value) -> Result<Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            Ok(serde_json::json!({"ok": true}))
        }
    }

    fn flaky(failures: u32, error: ToolError) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
            error,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let tool = flaky(2, ToolError::Transient("503".into()));
        let dyn_tool: Arc<dyn Tool> = tool.clone();
        let exec = ToolExecutor::new(Duration::from_secs(1), RetryPolicy::default());
        let out = exec
            .execute(&dyn_tool, &Value::Null, "s", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out["ok"], true);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let tool = flaky(5, ToolError::Rejected("out of stock".into()));
        let dyn_tool: Arc<dyn Tool> = tool.clone();
        let exec = ToolExecutor::new(Duration::from_secs(1), RetryPolicy::default());
        let err = exec
            .execute(&dyn_tool, &Value::Null, "s", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolFailure::Backend { transient: false, .. }));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let tool = flaky(10, ToolError::Transient("503".into()));
        let dyn_tool: Arc<dyn Tool> = tool.clone();
        let exec = ToolExecutor::new(Duration::from_secs(1), RetryPolicy::default());
        let err = exec
            .execute(&dyn_tool, &Value::Null, "s", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolFailure::Backend { transient: true, .. }));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_doubles() {
        let p = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        };
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(2), Duration::from_millis(250));
    }
}
