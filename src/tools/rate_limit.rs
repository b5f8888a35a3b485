//! 固定窗口限流：按 (tool, session) 计数，每个窗口最多 quota 次
//!
//! 计数器跨会话共享，更新在互斥锁内完成。时间取 tokio::time::Instant，便于测试中暂停时钟。
//! 每 SWEEP_EVERY 次调用顺带清理一次已过期的窗口，键数量不随会话数无限增长。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed {
        remaining: u32,
        window_started: Instant,
    },
    Limited {
        retry_after: Duration,
    },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// 每多少次 acquire 清理一次过期窗口
pub const SWEEP_EVERY: u64 = 256;

#[derive(Debug, Default)]
struct Windows {
    by_key: HashMap<(String, String), Window>,
    acquires: u64,
}

impl Windows {
    fn sweep(&mut self, now: Instant, period: Duration) {
        let before = self.by_key.len();
        self.by_key
            .retain(|_, w| now.saturating_duration_since(w.started) < period);
        let evicted = before - self.by_key.len();
        if evicted > 0 {
            tracing::debug!(evicted, retained = self.by_key.len(), "rate limit windows swept");
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<Windows>,
    quota: u32,
    period: Duration,
}

impl RateLimiter {
    pub fn new(quota: u32, period: Duration) -> Self {
        Self {
            windows: Mutex::new(Windows::default()),
            quota,
            period,
        }
    }

    pub fn quota(&self) -> u32 {
        self.quota
    }

    pub fn try_acquire(&self, tool: &str, session: &str) -> RateLimitResult {
        self.try_acquire_at(tool, session, Instant::now())
    }

    /// 以给定时刻计数（now 不应早于同一键上一次调用的时刻）
    pub fn try_acquire_at(&self, tool: &str, session: &str, now: Instant) -> RateLimitResult {
        let Ok(mut windows) = self.windows.lock() else {
            // 锁中毒时拒绝，不放行
            return RateLimitResult::Limited {
                retry_after: self.period,
            };
        };
        windows.acquires += 1;
        if windows.acquires % SWEEP_EVERY == 0 {
            windows.sweep(now, self.period);
        }
        let window = windows
            .by_key
            .entry((tool.to_string(), session.to_string()))
            .or_insert(Window { started: now, count: 0 });

        if now.saturating_duration_since(window.started) >= self.period {
            *window = Window { started: now, count: 0 };
        }

        if window.count < self.quota {
            window.count += 1;
            RateLimitResult::Allowed {
                remaining: self.quota - window.count,
                window_started: window.started,
            }
        } else {
            let elapsed = now.saturating_duration_since(window.started);
            RateLimitResult::Limited {
                retry_after: self.period.saturating_sub(elapsed),
            }
        }
    }

    /// 只查看不计数：该键此刻是否还有余量
    pub fn check(&self, tool: &str, session: &str) -> RateLimitResult {
        self.check_at(tool, session, Instant::now())
    }

    pub fn check_at(&self, tool: &str, session: &str, now: Instant) -> RateLimitResult {
        let Ok(windows) = self.windows.lock() else {
            return RateLimitResult::Limited {
                retry_after: self.period,
            };
        };
        match windows.by_key.get(&(tool.to_string(), session.to_string())) {
            Some(w) if now.saturating_duration_since(w.started) < self.period && w.count >= self.quota => {
                RateLimitResult::Limited {
                    retry_after: self.period.saturating_sub(now.saturating_duration_since(w.started)),
                }
            }
            Some(w) if now.saturating_duration_since(w.started) < self.period => RateLimitResult::Allowed {
                remaining: self.quota - w.count,
                window_started: w.started,
            },
            _ => RateLimitResult::Allowed {
                remaining: self.quota,
                window_started: now,
            },
        }
    }

    /// 当前保留的窗口数
    pub fn window_count(&self) -> usize {
        self.windows.lock().map(|w| w.by_key.len()).unwrap_or(0)
    }
}
