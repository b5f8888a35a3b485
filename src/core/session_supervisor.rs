//! 会话监管：取消令牌的生命周期
//!
//! 会话级令牌传播到进行中的工具调用、挂起的审批与子智能体。一次被取消的轮次结束后换发新令牌，
//! 会话可以继续接收新的轮次。

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 创建子 token（用于单个子任务）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// 已取消则换发新令牌；返回是否换发
    pub fn reset_if_cancelled(&mut self) -> bool {
        if self.cancel_token.is_cancelled() {
            self.cancel_token = CancellationToken::new();
            true
        } else {
            false
        }
    }
}
