//! 进程内存储（不持久化）

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    check_context, check_id, check_memory, check_memory_key, check_owner, check_procedure,
    check_query, check_rule, check_state, immutable_memory_error, now, AgentContext, Procedure,
    Rule, Store, StoreKind,
};
use crate::core::{AgentState, StoreError};
use crate::memory::{rank_memories, MemoryEntry, MemoryQuery, MemoryRecord};

type OwnerKey = (String, String);

/// 值 + Store 维护的时间戳
#[derive(Clone)]
struct Stamped<T> {
    value: T,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    contexts: HashMap<OwnerKey, Stamped<AgentContext>>,
    states: HashMap<OwnerKey, Stamped<AgentState>>,
    memories: HashMap<String, Stamped<MemoryEntry>>,
    procedures: BTreeMap<String, Stamped<Procedure>>,
    rules: HashMap<String, Stamped<Rule>>,
}

/// 写入时保留 created_at，刷新 updated_at
fn stamp<K: std::hash::Hash + Eq, T>(map: &mut HashMap<K, Stamped<T>>, key: K, value: T) {
    let at = now();
    let created_at = map.get(&key).map_or(at, |s| s.created_at);
    map.insert(
        key,
        Stamped {
            value,
            created_at,
            updated_at: at,
        },
    );
}

/// 内存 Store：整张表放在一个 RwLock 下，每次写入天然原子
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    closed: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::BackendUnavailable(
                "in-memory store is closed".to_string(),
            ));
        }
        Ok(())
    }
}

fn owner_key(agent_id: &str, user_id: &str) -> OwnerKey {
    (agent_id.to_string(), user_id.to_string())
}

#[async_trait]
impl Store for InMemoryStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }

    async fn upsert_agent_context(&self, ctx: &AgentContext) -> Result<(), StoreError> {
        check_context(ctx)?;
        self.ensure_open()?;
        let mut tables = self.tables.write().await;
        stamp(
            &mut tables.contexts,
            owner_key(&ctx.agent_id, &ctx.user_id),
            ctx.clone(),
        );
        Ok(())
    }

    async fn get_agent_context(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<Option<AgentContext>, StoreError> {
        check_owner(agent_id, user_id)?;
        self.ensure_open()?;
        let tables = self.tables.read().await;
        Ok(tables
            .contexts
            .get(&owner_key(agent_id, user_id))
            .map(|s| s.value.clone()))
    }

    async fn upsert_agent_state(&self, state: &AgentState) -> Result<(), StoreError> {
        check_state(state)?;
        self.ensure_open()?;
        let mut tables = self.tables.write().await;
        stamp(
            &mut tables.states,
            owner_key(&state.agent_id, &state.user_id),
            state.clone(),
        );
        Ok(())
    }

    async fn get_agent_state(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<Option<AgentState>, StoreError> {
        check_owner(agent_id, user_id)?;
        self.ensure_open()?;
        let tables = self.tables.read().await;
        Ok(tables
            .states
            .get(&owner_key(agent_id, user_id))
            .map(|s| s.value.clone()))
    }

    async fn upsert_memory(&self, entry: &MemoryEntry) -> Result<(), StoreError> {
        check_memory(entry)?;
        self.ensure_open()?;
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.memories.get(&entry.memory_id) {
            let same_identity = existing.value.memory_type == entry.memory_type
                && existing.value.is_owned_by(&entry.user_id, &entry.agent_id);
            if !same_identity {
                return Err(immutable_memory_error(&entry.memory_id));
            }
        }
        stamp(&mut tables.memories, entry.memory_id.clone(), entry.clone());
        Ok(())
    }

    async fn get_memory_record(
        &self,
        memory_id: &str,
        user_id: &str,
        agent_id: &str,
    ) -> Result<Option<MemoryRecord>, StoreError> {
        check_memory_key(memory_id, user_id, agent_id)?;
        self.ensure_open()?;
        let tables = self.tables.read().await;
        Ok(tables
            .memories
            .get(memory_id)
            .filter(|s| s.value.is_owned_by(user_id, agent_id))
            .map(|s| MemoryRecord {
                entry: s.value.clone(),
                created_at: s.created_at,
                updated_at: s.updated_at,
            }))
    }

    async fn search_memories(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>, StoreError> {
        check_query(query)?;
        self.ensure_open()?;
        let tables = self.tables.read().await;
        let candidates = tables.memories.values().map(|s| MemoryRecord {
            entry: s.value.clone(),
            created_at: s.created_at,
            updated_at: s.updated_at,
        });
        Ok(rank_memories(candidates, query))
    }

    async fn upsert_procedure(&self, procedure: &Procedure) -> Result<(), StoreError> {
        check_procedure(procedure)?;
        self.ensure_open()?;
        let mut tables = self.tables.write().await;
        let at = now();
        let created_at = tables
            .procedures
            .get(&procedure.procedure_id)
            .map_or(at, |s| s.created_at);
        tables.procedures.insert(
            procedure.procedure_id.clone(),
            Stamped {
                value: procedure.clone(),
                created_at,
                updated_at: at,
            },
        );
        Ok(())
    }

    async fn get_procedure(&self, procedure_id: &str) -> Result<Option<Procedure>, StoreError> {
        check_id("procedure_id", procedure_id)?;
        self.ensure_open()?;
        let tables = self.tables.read().await;
        Ok(tables.procedures.get(procedure_id).map(|s| s.value.clone()))
    }

    async fn list_procedure_ids(&self) -> Result<Vec<String>, StoreError> {
        self.ensure_open()?;
        let tables = self.tables.read().await;
        Ok(tables.procedures.keys().cloned().collect())
    }

    async fn upsert_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        check_rule(rule)?;
        self.ensure_open()?;
        let mut tables = self.tables.write().await;
        stamp(&mut tables.rules, rule.rule_id.clone(), rule.clone());
        Ok(())
    }

    async fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>, StoreError> {
        check_id("rule_id", rule_id)?;
        self.ensure_open()?;
        let tables = self.tables.read().await;
        Ok(tables.rules.get(rule_id).map(|s| s.value.clone()))
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
