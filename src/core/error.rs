//! 引擎错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 EngineError 决定 RetryAfter（退避后重试同一步）还是 Halt。

use std::time::Duration;

use thiserror::Error;

use crate::llm::LlmError;

/// Store 层错误；「未找到」不是错误，查询接口返回 `Option`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// 空 ID、非正 limit、非法分数等，在访问后端之前即被拒绝
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 连接失败、连接池耗尽、Store 已关闭
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// 行数据无法解析（JSON 列损坏、未知枚举值）
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}

/// 引擎（PhaseRunner / Orchestrator）对外暴露的错误
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Model(#[from] LlmError),

    /// 通过 ID 引用的 Procedure / Rule 不存在
    #[error("Config error: {0}")]
    Configuration(String),

    #[error("Agent task failed: {0}")]
    TaskFailed(String),
}

impl EngineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Model(LlmError::Cancelled))
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待后重试同一步（状态未被修改）
    RetryAfter(Duration),
    /// 终止该 Agent 的循环，把错误交给宿主
    Halt,
}
