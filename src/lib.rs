//! Keeper - 持久化 Agent 执行引擎
//!
//! 模块划分：
//! - **catalog**: 过程与规则的只读目录
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、执行状态、阶段状态机、主控循环
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **mailbox**: 信箱接口
//! - **memory**: 对话记录、记忆条目与相关度检索
//! - **observability**: 日志初始化
//! - **store**: 统一持久化接口（内存 / SQLite / PostgreSQL）

pub mod catalog;
pub mod config;
pub mod core;
pub mod llm;
pub mod mailbox;
pub mod memory;
pub mod observability;
pub mod store;

pub use crate::catalog::ProcedureCatalog;
pub use crate::config::{load_config, AppConfig};
pub use crate::core::{
    AgentPhase, AgentState, EngineError, Orchestrator, PhaseRunner, RunOutcome, StoreError,
};
pub use crate::store::{create_store, Store, StoreKind};
