//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient：给定 system + user 两段提示词，
//! 在超时时间内返回一段文本回复。

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// 模型调用失败；调用失败时不应修改任何 Agent 状态
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("Model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Model unavailable: {0}")]
    Unavailable(String),

    #[error("Model call cancelled")]
    Cancelled,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        timeout: Duration,
    ) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
