//! 脚本化 LLM 客户端（用于测试，无需 API）
//!
//! 按入队顺序依次返回预设回复或错误；记录每次收到的消息，便于断言模型看到了什么。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, ModelReply, ToolDescriptor};
use crate::memory::Message;

struct Step {
    delay: Option<Duration>,
    result: Result<ModelReply, LlmError>,
}

#[derive(Default)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies(replies: impl IntoIterator<Item = ModelReply>) -> Self {
        let client = Self::new();
        for reply in replies {
            client.push_reply(reply);
        }
        client
    }

    fn push(&self, step: Step) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(step);
        }
    }

    pub fn push_reply(&self, reply: ModelReply) {
        self.push(Step {
            delay: None,
            result: Ok(reply),
        });
    }

    pub fn push_error(&self, error: LlmError) {
        self.push(Step {
            delay: None,
            result: Err(error),
        });
    }

    /// 等待 delay 后再返回（模拟慢模型，配合取消测试）
    pub fn push_delayed(&self, reply: ModelReply, delay: Duration) {
        self.push(Step {
            delay: Some(delay),
            result: Ok(reply),
        });
    }

    /// 已收到的调用次数
    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// 每次调用收到的消息
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message], _tools: &[ToolDescriptor]) -> Result<ModelReply, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
        let step = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let Some(step) = step else {
            return Err(LlmError::ApiError("script exhausted".to_string()));
        };
        if let Some(delay) = step.delay {
            tokio::time::sleep(delay).await;
        }
        step.result
    }
}
