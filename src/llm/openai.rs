//! OpenAI 兼容端点（OpenAI、DeepSeek 或自建代理）

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};

/// 进程内累计 token 数
#[derive(Debug, Default)]
pub struct TokenUsage {
    prompt: AtomicU64,
    completion: AtomicU64,
}

impl TokenUsage {
    pub fn record(&self, prompt: u64, completion: u64) {
        self.prompt.fetch_add(prompt, Ordering::Relaxed);
        self.completion.fetch_add(completion, Ordering::Relaxed);
    }

    /// (prompt, completion, total)
    pub fn snapshot(&self) -> (u64, u64, u64) {
        let prompt = self.prompt.load(Ordering::Relaxed);
        let completion = self.completion.load(Ordering::Relaxed);
        (prompt, completion, prompt + completion)
    }
}

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    usage: TokenUsage,
}

impl OpenAiClient {
    /// api_key 为空时读取 OPENAI_API_KEY
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let mut config = OpenAIConfig::new();
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        if let Some(key) = api_key
            .map(str::to_string)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        {
            config = config.with_api_key(key);
        }
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: TokenUsage::default(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn request(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(build_messages(system_prompt, user_prompt)?)
            .build()
            .map_err(map_openai_err)?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(map_openai_err)?;

        if let Some(usage) = &response.usage {
            self.usage
                .record(u64::from(usage.prompt_tokens), u64::from(usage.completion_tokens));
        }

        // 没有 content 视为本次调用失败，由上层重试
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::Unavailable(format!("{} returned no content", self.model)))
    }
}

/// 每次调用只发送 system + user 两条消息；历史已折叠进 system 提示词
fn build_messages(
    system_prompt: &str,
    user_prompt: &str,
) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
    let system = ChatCompletionRequestSystemMessageArgs::default()
        .content(system_prompt)
        .build()
        .map_err(map_openai_err)?;
    let user = ChatCompletionRequestUserMessageArgs::default()
        .content(user_prompt)
        .build()
        .map_err(map_openai_err)?;
    Ok(vec![system.into(), user.into()])
}

fn map_openai_err(err: OpenAIError) -> LlmError {
    LlmError::Unavailable(err.to_string())
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        timeout: Duration,
    ) -> Result<String, LlmError> {
        match tokio::time::timeout(timeout, self.request(system_prompt, user_prompt)).await {
            Ok(reply) => reply,
            Err(_) => Err(LlmError::Timeout(timeout)),
        }
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.snapshot()
    }
}
