//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! - `MockLlmClient`：确定性回复；校验类提示词返回成功短语，可让过程完整跑通
//! - `ScriptedLlmClient`：按顺序返回预设结果，并记录收到的提示词

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};

/// Mock 客户端：回显 user 提示词首行
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        _system_prompt: &str,
        user_prompt: &str,
        _timeout: Duration,
    ) -> Result<String, LlmError> {
        if user_prompt.to_lowercase().contains("verify") {
            return Ok("All steps executed. Procedure complete.".to_string());
        }
        let first_line = user_prompt.lines().next().unwrap_or("(no input)");
        Ok(format!("Echo from Mock: {}", first_line))
    }
}

/// 一次调用收到的提示词
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPrompt {
    pub system: String,
    pub user: String,
}

/// 脚本化客户端：依次弹出预设结果；脚本耗尽后返回 fallback
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Result<String, LlmError>,
    delay: Option<Duration>,
    prompts: Mutex<Vec<RecordedPrompt>>,
}

impl ScriptedLlmClient {
    pub fn new(script: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Ok("ok".to_string()),
            delay: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// 每次调用都返回同一回复
    pub fn always(reply: impl Into<String>) -> Self {
        Self::new(Vec::new()).with_fallback(Ok(reply.into()))
    }

    pub fn with_fallback(mut self, fallback: Result<String, LlmError>) -> Self {
        self.fallback = fallback;
        self
    }

    /// 每次调用先等待 delay（用于超时、取消测试）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn prompts(&self) -> Vec<RecordedPrompt> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        _timeout: Duration,
    ) -> Result<String, LlmError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(RecordedPrompt {
                system: system_prompt.to_string(),
                user: user_prompt.to_string(),
            });
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or_else(|| self.fallback.clone())
    }
}
