//! 嵌入式单文件存储（rusqlite）
//!
//! 单连接放在 `tokio::sync::Mutex` 中，所有操作在 `spawn_blocking` 内执行，不阻塞异步运行时。
//! 列表类字段（步骤、规则 ID）以 JSON 数组存储，保证顺序与内容原样往返。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tokio::sync::Mutex;

use super::{
    check_context, check_id, check_memory, check_memory_key, check_owner, check_procedure,
    check_query, check_rule, check_state, immutable_memory_error, now, AgentContext, Complexity,
    Procedure, Rule, Store, StoreKind,
};
use crate::core::{AgentState, StoreError};
use crate::memory::{rank_memories, MemoryEntry, MemoryQuery, MemoryRecord, MemoryType};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS agent_context (
    agent_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    agent_name TEXT NOT NULL,
    personality TEXT NOT NULL,
    rule_ids TEXT NOT NULL,
    state_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (agent_id, user_id)
);

CREATE TABLE IF NOT EXISTS agent_state (
    agent_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    state_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (agent_id, user_id)
);

CREATE TABLE IF NOT EXISTS memory (
    memory_id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    memory_type TEXT NOT NULL,
    content TEXT NOT NULL,
    relevance_score REAL NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memory_owner ON memory(user_id, agent_id, memory_type);

CREATE TABLE IF NOT EXISTS procedures (
    procedure_id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    steps TEXT NOT NULL,
    complexity TEXT NOT NULL,
    rule_ids TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rules (
    rule_id TEXT PRIMARY KEY NOT NULL,
    rule_text TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// 关闭后连接被取走，后续操作返回 BackendUnavailable
pub struct SqliteStore {
    conn: Arc<Mutex<Option<Connection>>>,
    path: PathBuf,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件并初始化表结构
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let db_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || {
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::BackendUnavailable(format!(
                        "failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
            let conn = Connection::open(&db_path).map_err(map_sqlite_err)?;
            conn.execute_batch(SCHEMA).map_err(map_sqlite_err)?;
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("task join error: {}", e)))??;

        tracing::debug!("SQLite store ready at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path,
        })
    }

    /// 临时内存数据库（测试用）
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:").await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 在阻塞线程上持有连接执行 f
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.blocking_lock();
            let conn = guard.as_mut().ok_or_else(|| {
                StoreError::BackendUnavailable("sqlite store is closed".to_string())
            })?;
            f(conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("task join error: {}", e)))?
    }
}

fn map_sqlite_err(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
            ) =>
        {
            StoreError::BackendUnavailable(err.to_string())
        }
        rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..) => {
            StoreError::Corrupt(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Backend(format!("encode: {}", e)))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw}: {e}")))
}

/// 行 -> 原始列，JSON 解析放在 rusqlite 回调之外，错误类型可以保持 StoreError
struct RawContext {
    agent_id: String,
    user_id: String,
    agent_name: String,
    personality: String,
    rule_ids: String,
    state_json: String,
}

impl RawContext {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            agent_id: row.get("agent_id")?,
            user_id: row.get("user_id")?,
            agent_name: row.get("agent_name")?,
            personality: row.get("personality")?,
            rule_ids: row.get("rule_ids")?,
            state_json: row.get("state_json")?,
        })
    }

    fn decode(self) -> Result<AgentContext, StoreError> {
        Ok(AgentContext {
            agent_id: self.agent_id,
            user_id: self.user_id,
            agent_name: self.agent_name,
            personality: self.personality,
            rule_ids: from_json(&self.rule_ids)?,
            state: from_json(&self.state_json)?,
        })
    }
}

struct RawMemory {
    memory_id: String,
    user_id: String,
    agent_id: String,
    memory_type: String,
    content: String,
    relevance_score: f64,
    created_at: String,
    updated_at: String,
}

impl RawMemory {
    const COLUMNS: &'static str =
        "memory_id, user_id, agent_id, memory_type, content, relevance_score, created_at, updated_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            memory_id: row.get("memory_id")?,
            user_id: row.get("user_id")?,
            agent_id: row.get("agent_id")?,
            memory_type: row.get("memory_type")?,
            content: row.get("content")?,
            relevance_score: row.get("relevance_score")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn decode(self) -> Result<MemoryRecord, StoreError> {
        let memory_type = MemoryType::parse(&self.memory_type).ok_or_else(|| {
            StoreError::Corrupt(format!("unknown memory type {}", self.memory_type))
        })?;
        Ok(MemoryRecord {
            entry: MemoryEntry {
                memory_id: self.memory_id,
                user_id: self.user_id,
                agent_id: self.agent_id,
                memory_type,
                content: self.content,
                relevance_score: self.relevance_score,
            },
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct RawProcedure {
    procedure_id: String,
    name: String,
    description: String,
    steps: String,
    complexity: String,
    rule_ids: String,
}

impl RawProcedure {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            procedure_id: row.get("procedure_id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            steps: row.get("steps")?,
            complexity: row.get("complexity")?,
            rule_ids: row.get("rule_ids")?,
        })
    }

    fn decode(self) -> Result<Procedure, StoreError> {
        let complexity = Complexity::parse(&self.complexity).ok_or_else(|| {
            StoreError::Corrupt(format!("unknown complexity {}", self.complexity))
        })?;
        Ok(Procedure {
            procedure_id: self.procedure_id,
            name: self.name,
            description: self.description,
            steps: from_json(&self.steps)?,
            complexity,
            rule_ids: from_json(&self.rule_ids)?,
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Sqlite
    }

    async fn upsert_agent_context(&self, ctx: &AgentContext) -> Result<(), StoreError> {
        check_context(ctx)?;
        let ctx = ctx.clone();
        let rule_ids = to_json(&ctx.rule_ids)?;
        let state_json = to_json(&ctx.state)?;
        let at = ts(now());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO agent_context (agent_id, user_id, agent_name, personality, rule_ids, state_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT (agent_id, user_id) DO UPDATE SET
                    agent_name = excluded.agent_name,
                    personality = excluded.personality,
                    rule_ids = excluded.rule_ids,
                    state_json = excluded.state_json,
                    updated_at = excluded.updated_at",
                params![
                    ctx.agent_id,
                    ctx.user_id,
                    ctx.agent_name,
                    ctx.personality,
                    rule_ids,
                    state_json,
                    at
                ],
            )
            .map_err(map_sqlite_err)?;
            Ok(())
        })
        .await
    }

    async fn get_agent_context(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<Option<AgentContext>, StoreError> {
        check_owner(agent_id, user_id)?;
        let (agent_id, user_id) = (agent_id.to_string(), user_id.to_string());
        let raw = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT agent_id, user_id, agent_name, personality, rule_ids, state_json
                     FROM agent_context WHERE agent_id = ?1 AND user_id = ?2",
                    params![agent_id, user_id],
                    RawContext::from_row,
                )
                .optional()
                .map_err(map_sqlite_err)
            })
            .await?;
        raw.map(RawContext::decode).transpose()
    }

    async fn upsert_agent_state(&self, state: &AgentState) -> Result<(), StoreError> {
        check_state(state)?;
        let state_json = to_json(state)?;
        let (agent_id, user_id) = (state.agent_id.clone(), state.user_id.clone());
        let at = ts(now());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO agent_state (agent_id, user_id, state_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT (agent_id, user_id) DO UPDATE SET
                    state_json = excluded.state_json,
                    updated_at = excluded.updated_at",
                params![agent_id, user_id, state_json, at],
            )
            .map_err(map_sqlite_err)?;
            Ok(())
        })
        .await
    }

    async fn get_agent_state(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<Option<AgentState>, StoreError> {
        check_owner(agent_id, user_id)?;
        let (agent_id, user_id) = (agent_id.to_string(), user_id.to_string());
        let raw: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT state_json FROM agent_state WHERE agent_id = ?1 AND user_id = ?2",
                    params![agent_id, user_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(map_sqlite_err)
            })
            .await?;
        raw.as_deref().map(from_json).transpose()
    }

    async fn upsert_memory(&self, entry: &MemoryEntry) -> Result<(), StoreError> {
        check_memory(entry)?;
        let entry = entry.clone();
        let at = ts(now());
        self.with_conn(move |conn| {
            // 类型或归属不一致时 DO UPDATE 的 WHERE 不成立，影响行数为 0
            let changed = conn
                .execute(
                    "INSERT INTO memory (memory_id, user_id, agent_id, memory_type, content, relevance_score, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                     ON CONFLICT (memory_id) DO UPDATE SET
                        content = excluded.content,
                        relevance_score = excluded.relevance_score,
                        updated_at = excluded.updated_at
                     WHERE memory.memory_type = excluded.memory_type
                       AND memory.user_id = excluded.user_id
                       AND memory.agent_id = excluded.agent_id",
                    params![
                        entry.memory_id,
                        entry.user_id,
                        entry.agent_id,
                        entry.memory_type.as_str(),
                        entry.content,
                        entry.relevance_score,
                        at
                    ],
                )
                .map_err(map_sqlite_err)?;
            if changed == 0 {
                return Err(immutable_memory_error(&entry.memory_id));
            }
            Ok(())
        })
        .await
    }

    async fn get_memory_record(
        &self,
        memory_id: &str,
        user_id: &str,
        agent_id: &str,
    ) -> Result<Option<MemoryRecord>, StoreError> {
        check_memory_key(memory_id, user_id, agent_id)?;
        let (memory_id, user_id, agent_id) =
            (memory_id.to_string(), user_id.to_string(), agent_id.to_string());
        let raw = self
            .with_conn(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM memory WHERE memory_id = ?1 AND user_id = ?2 AND agent_id = ?3",
                        RawMemory::COLUMNS
                    ),
                    params![memory_id, user_id, agent_id],
                    RawMemory::from_row,
                )
                .optional()
                .map_err(map_sqlite_err)
            })
            .await?;
        raw.map(RawMemory::decode).transpose()
    }

    async fn search_memories(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>, StoreError> {
        check_query(query)?;
        let (user_id, agent_id) = (query.user_id.clone(), query.agent_id.clone());
        let memory_type = query.memory_type.map(|t| t.as_str());
        // SQLite 的 LIKE 只对 ASCII 大小写不敏感，文本过滤与排序交给 rank_memories
        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM memory
                         WHERE user_id = ?1 AND agent_id = ?2 AND (?3 IS NULL OR memory_type = ?3)",
                        RawMemory::COLUMNS
                    ))
                    .map_err(map_sqlite_err)?;
                let rows = stmt
                    .query_map(params![user_id, agent_id, memory_type], RawMemory::from_row)
                    .map_err(map_sqlite_err)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(map_sqlite_err)?;
                Ok(rows)
            })
            .await?;
        let records = rows
            .into_iter()
            .map(RawMemory::decode)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rank_memories(records, query))
    }

    async fn upsert_procedure(&self, procedure: &Procedure) -> Result<(), StoreError> {
        check_procedure(procedure)?;
        let procedure = procedure.clone();
        let steps = to_json(&procedure.steps)?;
        let rule_ids = to_json(&procedure.rule_ids)?;
        let at = ts(now());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO procedures (procedure_id, name, description, steps, complexity, rule_ids, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT (procedure_id) DO UPDATE SET
                    name = excluded.name,
                    description = excluded.description,
                    steps = excluded.steps,
                    complexity = excluded.complexity,
                    rule_ids = excluded.rule_ids,
                    updated_at = excluded.updated_at",
                params![
                    procedure.procedure_id,
                    procedure.name,
                    procedure.description,
                    steps,
                    procedure.complexity.as_str(),
                    rule_ids,
                    at
                ],
            )
            .map_err(map_sqlite_err)?;
            Ok(())
        })
        .await
    }

    async fn get_procedure(&self, procedure_id: &str) -> Result<Option<Procedure>, StoreError> {
        check_id("procedure_id", procedure_id)?;
        let procedure_id = procedure_id.to_string();
        let raw = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT procedure_id, name, description, steps, complexity, rule_ids
                     FROM procedures WHERE procedure_id = ?1",
                    params![procedure_id],
                    RawProcedure::from_row,
                )
                .optional()
                .map_err(map_sqlite_err)
            })
            .await?;
        raw.map(RawProcedure::decode).transpose()
    }

    async fn list_procedure_ids(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT procedure_id FROM procedures ORDER BY procedure_id")
                .map_err(map_sqlite_err)?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(map_sqlite_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_sqlite_err)?;
            Ok(ids)
        })
        .await
    }

    async fn upsert_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        check_rule(rule)?;
        let rule = rule.clone();
        let at = ts(now());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO rules (rule_id, rule_text, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT (rule_id) DO UPDATE SET
                    rule_text = excluded.rule_text,
                    updated_at = excluded.updated_at",
                params![rule.rule_id, rule.text, at],
            )
            .map_err(map_sqlite_err)?;
            Ok(())
        })
        .await
    }

    async fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>, StoreError> {
        check_id("rule_id", rule_id)?;
        let rule_id = rule_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT rule_id, rule_text FROM rules WHERE rule_id = ?1",
                params![rule_id],
                |row| {
                    Ok(Rule {
                        rule_id: row.get(0)?,
                        text: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(map_sqlite_err)
        })
        .await
    }

    async fn close(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            tokio::task::spawn_blocking(move || conn.close().map_err(|(_, e)| map_sqlite_err(e)))
                .await
                .map_err(|e| StoreError::Backend(format!("task join error: {}", e)))??;
            tracing::debug!("SQLite store at {} closed", self.path.display());
        }
        Ok(())
    }
}
