//! 网络数据库存储（PostgreSQL + sqlx 连接池）
//!
//! 需要启用 `postgres` feature。表结构与 SQLite 后端一致；列表字段用 TEXT[]，
//! 附加数据与状态用 JSONB，时间戳用 TIMESTAMPTZ。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;

use super::{
    check_context, check_id, check_memory, check_memory_key, check_owner, check_procedure,
    check_query, check_rule, check_state, immutable_memory_error, now, AgentContext, Complexity,
    Procedure, Rule, Store, StoreKind,
};
use crate::core::{AgentState, StoreError};
use crate::memory::{rank_memories, MemoryEntry, MemoryQuery, MemoryRecord, MemoryType};

const SCHEMA: [&str; 6] = [
    "CREATE TABLE IF NOT EXISTS agent_context (
        agent_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        agent_name TEXT NOT NULL,
        personality TEXT NOT NULL,
        rule_ids TEXT[] NOT NULL,
        state_json JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (agent_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS agent_state (
        agent_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        state_json JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (agent_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS memory (
        memory_id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        memory_type TEXT NOT NULL,
        content TEXT NOT NULL,
        relevance_score DOUBLE PRECISION NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_memory_owner ON memory(user_id, agent_id, memory_type)",
    "CREATE TABLE IF NOT EXISTS procedures (
        procedure_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL,
        steps TEXT[] NOT NULL,
        complexity TEXT NOT NULL,
        rule_ids TEXT[] NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS rules (
        rule_id TEXT PRIMARY KEY,
        rule_text TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
];

const MEMORY_COLUMNS: &str =
    "memory_id, user_id, agent_id, memory_type, content, relevance_score, created_at, updated_at";

/// PostgreSQL Store：连接池由 sqlx 管理，所有方法可并发调用
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// 连接并初始化表结构
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(map_sqlx_err)?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    /// 从已有连接池创建（调用方负责建表）
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 幂等建表
    pub async fn init_tables(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        }
        Ok(())
    }
}

fn map_sqlx_err(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => StoreError::BackendUnavailable(err.to_string()),
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
            StoreError::Corrupt(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn memory_from_row(row: &PgRow) -> Result<MemoryRecord, StoreError> {
    let memory_type: String = row.try_get("memory_type").map_err(map_sqlx_err)?;
    let memory_type = MemoryType::parse(&memory_type)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown memory type {memory_type}")))?;
    Ok(MemoryRecord {
        entry: MemoryEntry {
            memory_id: row.try_get("memory_id").map_err(map_sqlx_err)?,
            user_id: row.try_get("user_id").map_err(map_sqlx_err)?,
            agent_id: row.try_get("agent_id").map_err(map_sqlx_err)?,
            memory_type,
            content: row.try_get("content").map_err(map_sqlx_err)?,
            relevance_score: row.try_get("relevance_score").map_err(map_sqlx_err)?,
        },
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(map_sqlx_err)?,
        updated_at: row
            .try_get::<DateTime<Utc>, _>("updated_at")
            .map_err(map_sqlx_err)?,
    })
}

fn procedure_from_row(row: &PgRow) -> Result<Procedure, StoreError> {
    let complexity: String = row.try_get("complexity").map_err(map_sqlx_err)?;
    let complexity = Complexity::parse(&complexity)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown complexity {complexity}")))?;
    Ok(Procedure {
        procedure_id: row.try_get("procedure_id").map_err(map_sqlx_err)?,
        name: row.try_get("name").map_err(map_sqlx_err)?,
        description: row.try_get("description").map_err(map_sqlx_err)?,
        steps: row.try_get("steps").map_err(map_sqlx_err)?,
        complexity,
        rule_ids: row.try_get("rule_ids").map_err(map_sqlx_err)?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Postgres
    }

    async fn upsert_agent_context(&self, ctx: &AgentContext) -> Result<(), StoreError> {
        check_context(ctx)?;
        sqlx::query(
            "INSERT INTO agent_context (agent_id, user_id, agent_name, personality, rule_ids, state_json, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
             ON CONFLICT (agent_id, user_id) DO UPDATE SET
                agent_name = EXCLUDED.agent_name,
                personality = EXCLUDED.personality,
                rule_ids = EXCLUDED.rule_ids,
                state_json = EXCLUDED.state_json,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(&ctx.agent_id)
        .bind(&ctx.user_id)
        .bind(&ctx.agent_name)
        .bind(&ctx.personality)
        .bind(&ctx.rule_ids)
        .bind(Json(&ctx.state))
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn get_agent_context(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<Option<AgentContext>, StoreError> {
        check_owner(agent_id, user_id)?;
        let row = sqlx::query(
            "SELECT agent_id, user_id, agent_name, personality, rule_ids, state_json
             FROM agent_context WHERE agent_id = $1 AND user_id = $2",
        )
        .bind(agent_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        row.map(|row| {
            let Json(state): Json<serde_json::Map<String, serde_json::Value>> =
                row.try_get("state_json").map_err(map_sqlx_err)?;
            Ok(AgentContext {
                agent_id: row.try_get("agent_id").map_err(map_sqlx_err)?,
                user_id: row.try_get("user_id").map_err(map_sqlx_err)?,
                agent_name: row.try_get("agent_name").map_err(map_sqlx_err)?,
                personality: row.try_get("personality").map_err(map_sqlx_err)?,
                rule_ids: row.try_get("rule_ids").map_err(map_sqlx_err)?,
                state,
            })
        })
        .transpose()
    }

    async fn upsert_agent_state(&self, state: &AgentState) -> Result<(), StoreError> {
        check_state(state)?;
        sqlx::query(
            "INSERT INTO agent_state (agent_id, user_id, state_json, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $4)
             ON CONFLICT (agent_id, user_id) DO UPDATE SET
                state_json = EXCLUDED.state_json,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(&state.agent_id)
        .bind(&state.user_id)
        .bind(Json(state))
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn get_agent_state(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<Option<AgentState>, StoreError> {
        check_owner(agent_id, user_id)?;
        let row: Option<(Json<AgentState>,)> = sqlx::query_as(
            "SELECT state_json FROM agent_state WHERE agent_id = $1 AND user_id = $2",
        )
        .bind(agent_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(row.map(|(Json(state),)| state))
    }

    async fn upsert_memory(&self, entry: &MemoryEntry) -> Result<(), StoreError> {
        check_memory(entry)?;
        let result = sqlx::query(
            "INSERT INTO memory (memory_id, user_id, agent_id, memory_type, content, relevance_score, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
             ON CONFLICT (memory_id) DO UPDATE SET
                content = EXCLUDED.content,
                relevance_score = EXCLUDED.relevance_score,
                updated_at = EXCLUDED.updated_at
             WHERE memory.memory_type = EXCLUDED.memory_type
               AND memory.user_id = EXCLUDED.user_id
               AND memory.agent_id = EXCLUDED.agent_id",
        )
        .bind(&entry.memory_id)
        .bind(&entry.user_id)
        .bind(&entry.agent_id)
        .bind(entry.memory_type.as_str())
        .bind(&entry.content)
        .bind(entry.relevance_score)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(immutable_memory_error(&entry.memory_id));
        }
        Ok(())
    }

    async fn get_memory_record(
        &self,
        memory_id: &str,
        user_id: &str,
        agent_id: &str,
    ) -> Result<Option<MemoryRecord>, StoreError> {
        check_memory_key(memory_id, user_id, agent_id)?;
        let row = sqlx::query(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memory WHERE memory_id = $1 AND user_id = $2 AND agent_id = $3"
        ))
        .bind(memory_id)
        .bind(user_id)
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        row.as_ref().map(memory_from_row).transpose()
    }

    async fn search_memories(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>, StoreError> {
        check_query(query)?;
        // ILIKE 与 Rust 的 to_lowercase 在部分字符上不一致，文本过滤统一交给 rank_memories
        let rows = sqlx::query(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memory
             WHERE user_id = $1 AND agent_id = $2 AND ($3::TEXT IS NULL OR memory_type = $3)"
        ))
        .bind(&query.user_id)
        .bind(&query.agent_id)
        .bind(query.memory_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let records = rows
            .iter()
            .map(memory_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rank_memories(records, query))
    }

    async fn upsert_procedure(&self, procedure: &Procedure) -> Result<(), StoreError> {
        check_procedure(procedure)?;
        sqlx::query(
            "INSERT INTO procedures (procedure_id, name, description, steps, complexity, rule_ids, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
             ON CONFLICT (procedure_id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                steps = EXCLUDED.steps,
                complexity = EXCLUDED.complexity,
                rule_ids = EXCLUDED.rule_ids,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(&procedure.procedure_id)
        .bind(&procedure.name)
        .bind(&procedure.description)
        .bind(&procedure.steps)
        .bind(procedure.complexity.as_str())
        .bind(&procedure.rule_ids)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn get_procedure(&self, procedure_id: &str) -> Result<Option<Procedure>, StoreError> {
        check_id("procedure_id", procedure_id)?;
        let row = sqlx::query(
            "SELECT procedure_id, name, description, steps, complexity, rule_ids
             FROM procedures WHERE procedure_id = $1",
        )
        .bind(procedure_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        row.as_ref().map(procedure_from_row).transpose()
    }

    async fn list_procedure_ids(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT procedure_id FROM procedures ORDER BY procedure_id COLLATE \"C\"")
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn upsert_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        check_rule(rule)?;
        sqlx::query(
            "INSERT INTO rules (rule_id, rule_text, created_at, updated_at)
             VALUES ($1, $2, $3, $3)
             ON CONFLICT (rule_id) DO UPDATE SET
                rule_text = EXCLUDED.rule_text,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(&rule.rule_id)
        .bind(&rule.text)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>, StoreError> {
        check_id("rule_id", rule_id)?;
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT rule_id, rule_text FROM rules WHERE rule_id = $1")
                .bind(rule_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        Ok(row.map(|(rule_id, text)| Rule { rule_id, text }))
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}
