//! 记忆条目：情景 / 语义 / 程序性记忆

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 记忆类型，创建后不可更改
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Episodic,
    Semantic,
    Procedural,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Episodic => "episodic",
            MemoryType::Semantic => "semantic",
            MemoryType::Procedural => "procedural",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "episodic" => Some(MemoryType::Episodic),
            "semantic" => Some(MemoryType::Semantic),
            "procedural" => Some(MemoryType::Procedural),
            _ => None,
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单条记忆，归属于 (user_id, agent_id)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub memory_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub memory_type: MemoryType,
    pub content: String,
    /// 相关度分数，越大越相关；可随时更新
    pub relevance_score: f64,
}

impl MemoryEntry {
    /// 生成随机 memory_id，默认分数 0.5
    pub fn new(
        user_id: impl Into<String>,
        agent_id: impl Into<String>,
        memory_type: MemoryType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            memory_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            agent_id: agent_id.into(),
            memory_type,
            content: content.into(),
            relevance_score: 0.5,
        }
    }

    pub fn with_id(mut self, memory_id: impl Into<String>) -> Self {
        self.memory_id = memory_id.into();
        self
    }

    pub fn with_relevance(mut self, score: f64) -> Self {
        self.relevance_score = score;
        self
    }

    pub fn is_owned_by(&self, user_id: &str, agent_id: &str) -> bool {
        self.user_id == user_id && self.agent_id == agent_id
    }
}

/// Store 返回的带时间戳记录；时间戳由 Store 维护，调用方不可设置
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryRecord {
    pub entry: MemoryEntry,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 记忆检索条件
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryQuery {
    pub user_id: String,
    pub agent_id: String,
    /// 大小写不敏感的子串；空串匹配全部
    pub text: String,
    pub memory_type: Option<MemoryType>,
    pub limit: usize,
}

impl MemoryQuery {
    pub fn new(user_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            agent_id: agent_id.into(),
            text: String::new(),
            memory_type: None,
            limit: 10,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = Some(memory_type);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}
