//! 任务调度：有界并发扇出
//!
//! 同一计划内的独立步骤并发执行，Semaphore 限制同时在途的数量；join_all 等待全部完成后
//! 按输入顺序（即计划声明顺序）返回结果，与完成先后无关。

use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Semaphore;

pub struct TaskScheduler {
    tool_semaphore: Arc<Semaphore>,
    limit: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        let limit = max_concurrent_tools.max(1);
        Self {
            tool_semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 并发运行全部任务，结果顺序与输入一致
    pub async fn join_ordered<F, T>(&self, tasks: Vec<F>) -> Vec<T>
    where
        F: Future<Output = T>,
    {
        let gated = tasks.into_iter().map(|task| {
            let semaphore = self.tool_semaphore.clone();
            async move {
                // 信号量从不关闭；万一关闭则不受限地继续
                let _permit = semaphore.acquire_owned().await.ok();
                task.await
            }
        });
        join_all(gated).await
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_results_in_input_order_with_bounded_parallelism() {
        let scheduler = TaskScheduler::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = [30u64, 10, 20, 5]
            .into_iter()
            .enumerate()
            .map(|(i, ms)| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    i
                }
            })
            .collect();

        let out = scheduler.join_ordered(tasks).await;
        assert_eq!(out, vec![0, 1, 2, 3]);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }
}
