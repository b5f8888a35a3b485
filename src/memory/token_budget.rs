//! Token 估算
//!
//! 不依赖具体分词器的启发式估算：英文约 4 字符/token，中文约 1.5 字符/token；
//! 消息另计固定开销，工具调用参数与结果载荷按序列化后的 JSON 计入。

use crate::memory::Message;

/// 每条消息的固定开销（角色、分隔符等）
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    pub fn estimate(text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 单条消息：正文 + 工具调用参数 + 工具结果载荷 + 固定开销
    pub fn estimate_message(msg: &Message) -> usize {
        let mut tokens = MESSAGE_OVERHEAD_TOKENS + Self::estimate(&msg.content);
        for call in &msg.tool_calls {
            tokens += Self::estimate(&call.tool) + Self::estimate(&call.args.to_string());
        }
        for result in &msg.tool_results {
            // 正文已包含结果的渲染文本，这里只计工具名与 call id
            tokens += Self::estimate(&result.tool) + Self::estimate(&result.call_id);
        }
        tokens
    }

    /// 整个活动窗口
    pub fn estimate_window(messages: &[Message]) -> usize {
        messages.iter().map(Self::estimate_message).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimator_english() {
        let text = "Hello, world! This is a test.";
        let tokens = TokenEstimator::estimate(text);
        assert!(tokens > 0);
        assert!(tokens < text.len());
    }

    #[test]
    fn test_token_estimator_chinese() {
        let text = "你好世界，这是一个测试。";
        assert_eq!(TokenEstimator::estimate(text), 8);
    }

    #[test]
    fn test_window_grows_with_messages() {
        let one = vec![Message::user("find me a blue kettle")];
        let mut two = one.clone();
        two.push(Message::assistant("Here are three kettles."));
        assert!(TokenEstimator::estimate_window(&two) > TokenEstimator::estimate_window(&one));
        assert_eq!(TokenEstimator::estimate(""), 0);
    }
}
