//! 持久化层：统一的 Store 接口与可替换后端
//!
//! 支持：
//! - `memory`: 进程内存储（不持久化，测试与参考实现）
//! - `sqlite`: 嵌入式单文件数据库（rusqlite，WAL）
//! - `postgres`: 网络数据库 + 连接池（sqlx，需启用 `postgres` feature）
//!
//! 所有后端行为一致：upsert 原子、查询返回 `Option`、记忆检索排序由
//! [`rank_memories`](crate::memory::rank_memories) 统一完成。

mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod sqlite;
mod types;

pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;
pub use types::{AgentContext, Complexity, Procedure, Rule};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::Deserialize;

use crate::config::StoreSection;
use crate::core::{AgentState, StoreError};
use crate::memory::{MemoryEntry, MemoryQuery, MemoryRecord};

/// 后端类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    #[default]
    Sqlite,
    #[serde(alias = "postgresql")]
    Postgres,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Memory => "memory",
            StoreKind::Sqlite => "sqlite",
            StoreKind::Postgres => "postgres",
        }
    }

    /// 是否跨进程重启保留数据
    pub fn is_persistent(&self) -> bool {
        !matches!(self, StoreKind::Memory)
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 持久化接口：所有后端实现同一契约
#[async_trait]
pub trait Store: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// 按 (agent_id, user_id) 插入或整体替换
    async fn upsert_agent_context(&self, ctx: &AgentContext) -> Result<(), StoreError>;

    async fn get_agent_context(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<Option<AgentContext>, StoreError>;

    /// 热路径：每次阶段转换后调用；键取自 state 自身的 (agent_id, user_id)
    async fn upsert_agent_state(&self, state: &AgentState) -> Result<(), StoreError>;

    async fn get_agent_state(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<Option<AgentState>, StoreError>;

    /// 按 memory_id 插入或替换；已存在的记忆不允许更改类型或归属
    async fn upsert_memory(&self, entry: &MemoryEntry) -> Result<(), StoreError>;

    /// 按三个键共同定位，带时间戳
    async fn get_memory_record(
        &self,
        memory_id: &str,
        user_id: &str,
        agent_id: &str,
    ) -> Result<Option<MemoryRecord>, StoreError>;

    async fn get_memory(
        &self,
        memory_id: &str,
        user_id: &str,
        agent_id: &str,
    ) -> Result<Option<MemoryEntry>, StoreError> {
        Ok(self
            .get_memory_record(memory_id, user_id, agent_id)
            .await?
            .map(|r| r.entry))
    }

    async fn search_memories(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>, StoreError>;

    async fn upsert_procedure(&self, procedure: &Procedure) -> Result<(), StoreError>;

    async fn get_procedure(&self, procedure_id: &str) -> Result<Option<Procedure>, StoreError>;

    /// 按 ID 升序
    async fn list_procedure_ids(&self) -> Result<Vec<String>, StoreError>;

    async fn upsert_rule(&self, rule: &Rule) -> Result<(), StoreError>;

    async fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>, StoreError>;

    /// 释放连接；可重复调用，之后的操作返回 BackendUnavailable
    async fn close(&self) -> Result<(), StoreError>;
}

/// 根据配置创建 Store
pub async fn create_store(cfg: &StoreSection) -> Result<Arc<dyn Store>, StoreError> {
    match cfg.backend {
        StoreKind::Memory => {
            tracing::info!("Using in-memory store (non-persistent)");
            Ok(Arc::new(InMemoryStore::new()))
        }
        StoreKind::Sqlite => {
            tracing::info!("Using SQLite store at {}", cfg.sqlite_path.display());
            Ok(Arc::new(SqliteStore::open(&cfg.sqlite_path).await?))
        }
        #[cfg(feature = "postgres")]
        StoreKind::Postgres => {
            let url = cfg.postgres_url.as_deref().ok_or_else(|| {
                StoreError::invalid("store.postgres_url is required for the postgres backend")
            })?;
            tracing::info!(
                "Using PostgreSQL store (max {} connections)",
                cfg.max_connections
            );
            Ok(Arc::new(
                PostgresStore::connect(url, cfg.max_connections, cfg.connect_timeout()).await?,
            ))
        }
        #[cfg(not(feature = "postgres"))]
        StoreKind::Postgres => Err(StoreError::BackendUnavailable(
            "built without the postgres feature".to_string(),
        )),
    }
}

/// Store 维护的时间戳，统一截断到微秒（与 PostgreSQL TIMESTAMPTZ 精度一致）
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn require(field: &str, value: &str) -> Result<(), StoreError> {
    if value.trim().is_empty() {
        return Err(StoreError::invalid(format!("{field} must not be empty")));
    }
    Ok(())
}

/// 主键查询参数不能为空
pub(crate) fn check_id(field: &str, value: &str) -> Result<(), StoreError> {
    require(field, value)
}

pub(crate) fn check_owner(agent_id: &str, user_id: &str) -> Result<(), StoreError> {
    require("agent_id", agent_id)?;
    require("user_id", user_id)
}

pub(crate) fn check_context(ctx: &AgentContext) -> Result<(), StoreError> {
    check_owner(&ctx.agent_id, &ctx.user_id)
}

pub(crate) fn check_state(state: &AgentState) -> Result<(), StoreError> {
    check_owner(&state.agent_id, &state.user_id)
}

pub(crate) fn check_memory(entry: &MemoryEntry) -> Result<(), StoreError> {
    require("memory_id", &entry.memory_id)?;
    check_owner(&entry.agent_id, &entry.user_id)?;
    if !entry.relevance_score.is_finite() {
        return Err(StoreError::invalid("relevance_score must be a finite number"));
    }
    Ok(())
}

pub(crate) fn check_memory_key(
    memory_id: &str,
    user_id: &str,
    agent_id: &str,
) -> Result<(), StoreError> {
    require("memory_id", memory_id)?;
    check_owner(agent_id, user_id)
}

pub(crate) fn check_query(query: &MemoryQuery) -> Result<(), StoreError> {
    check_owner(&query.agent_id, &query.user_id)?;
    if query.limit == 0 {
        return Err(StoreError::invalid("limit must be positive"));
    }
    Ok(())
}

pub(crate) fn check_procedure(procedure: &Procedure) -> Result<(), StoreError> {
    require("procedure_id", &procedure.procedure_id)
}

pub(crate) fn check_rule(rule: &Rule) -> Result<(), StoreError> {
    require("rule_id", &rule.rule_id)
}

pub(crate) fn immutable_memory_error(memory_id: &str) -> StoreError {
    StoreError::invalid(format!(
        "memory {memory_id} already exists with a different type or owner"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryType;

    #[test]
    fn test_store_kind_from_config_value() {
        let kind: StoreKind = serde_json::from_str("\"postgresql\"").unwrap();
        assert_eq!(kind, StoreKind::Postgres);
        assert!(!StoreKind::Memory.is_persistent());
    }

    #[test]
    fn test_empty_ids_rejected() {
        assert!(matches!(
            check_owner("", "u"),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            check_owner("a", "  "),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(check_owner("a", "u").is_ok());
    }

    #[test]
    fn test_non_finite_score_rejected() {
        let entry = MemoryEntry::new("u", "a", MemoryType::Semantic, "x").with_relevance(f64::NAN);
        assert!(check_memory(&entry).is_err());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let query = MemoryQuery::new("u", "a").with_limit(0);
        assert_eq!(
            check_query(&query),
            Err(StoreError::InvalidArgument("limit must be positive".to_string()))
        );
    }

    #[tokio::test]
    async fn test_create_memory_store() {
        let cfg = StoreSection {
            backend: StoreKind::Memory,
            ..StoreSection::default()
        };
        let store = create_store(&cfg).await.unwrap();
        assert_eq!(store.kind(), StoreKind::Memory);
    }
}
