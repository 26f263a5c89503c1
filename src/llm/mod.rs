//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{MockLlmClient, RecordedPrompt, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, LlmError};

use std::sync::Arc;

use crate::config::LlmSection;

/// DeepSeek 提供与 OpenAI 完全兼容的接口
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let provider = cfg.provider.to_lowercase();
    let deepseek_key = std::env::var("DEEPSEEK_API_KEY").ok();
    let openai_key = std::env::var("OPENAI_API_KEY").ok();

    if provider == "mock" {
        tracing::info!("Using Mock LLM");
        return Arc::new(MockLlmClient);
    }

    // 有 DeepSeek Key，或配置为 deepseek 且仅有 OpenAI Key 时也走 DeepSeek 兼容端点
    let deepseek = deepseek_key
        .clone()
        .or_else(|| openai_key.clone().filter(|_| provider == "deepseek"));
    if provider == "deepseek" || (deepseek_key.is_some() && openai_key.is_none()) {
        if let Some(key) = deepseek {
            let model = cfg.model.clone().unwrap_or_else(|| DEEPSEEK_CHAT.to_string());
            let base = cfg.base_url.as_deref().unwrap_or(DEEPSEEK_BASE_URL);
            tracing::info!("Using DeepSeek LLM ({})", model);
            return Arc::new(OpenAiClient::new(Some(base), &model, Some(&key)));
        }
    }

    if let Some(key) = openai_key {
        let model = cfg.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
        tracing::info!("Using OpenAI LLM ({})", model);
        return Arc::new(OpenAiClient::new(cfg.base_url.as_deref(), &model, Some(&key)));
    }

    tracing::warn!("No API key set or provider unknown, using Mock LLM");
    Arc::new(MockLlmClient)
}
