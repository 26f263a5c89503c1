//! 错误恢复引擎
//!
//! 根据 EngineError 类型与已尝试次数返回 RecoveryAction，供 Orchestrator 决定是退避重试还是停止。

use std::time::Duration;

use crate::config::OrchestratorSection;
use crate::core::{EngineError, RecoveryAction};
use crate::llm::LlmError;

/// 模型调用失败时按指数退避重试；其余错误一律停止
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RecoveryEngine {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(cfg: &OrchestratorSection) -> Self {
        Self::new(
            cfg.max_model_attempts,
            Duration::from_millis(cfg.retry_base_delay_ms),
            Duration::from_millis(cfg.retry_max_delay_ms),
        )
    }

    /// `attempt` 从 1 开始，表示刚刚失败的是第几次尝试
    pub fn handle(&self, err: &EngineError, attempt: u32) -> RecoveryAction {
        match err {
            EngineError::Model(LlmError::Timeout(_)) | EngineError::Model(LlmError::Unavailable(_))
                if attempt < self.max_attempts =>
            {
                RecoveryAction::RetryAfter(self.delay_for(attempt))
            }
            _ => RecoveryAction::Halt,
        }
    }

    /// base * 2^(attempt-1)，封顶 max_delay
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::from_config(&OrchestratorSection::default())
    }
}
