//! 持久化实体：AgentContext、Procedure、Rule

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Agent 的人设与长期配置，每个 (agent_id, user_id) 一份
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    pub agent_id: String,
    pub user_id: String,
    pub agent_name: String,
    #[serde(default)]
    pub personality: String,
    /// 有序规则 ID 列表
    #[serde(default)]
    pub rule_ids: Vec<String>,
    /// 开放的附加数据
    #[serde(default)]
    pub state: Map<String, Value>,
}

impl AgentContext {
    pub fn new(
        agent_id: impl Into<String>,
        user_id: impl Into<String>,
        agent_name: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            user_id: user_id.into(),
            agent_name: agent_name.into(),
            personality: String::new(),
            rule_ids: Vec::new(),
            state: Map::new(),
        }
    }

    pub fn with_personality(mut self, personality: impl Into<String>) -> Self {
        self.personality = personality.into();
        self
    }

    pub fn with_rule_ids(mut self, rule_ids: Vec<String>) -> Self {
        self.rule_ids = rule_ids;
        self
    }

    pub fn with_state_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.state.insert(key.into(), value);
        self
    }
}

/// 过程复杂度
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Complexity {
    Simple,
    #[default]
    Standard,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "SIMPLE",
            Complexity::Standard => "STANDARD",
            Complexity::Complex => "COMPLEX",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SIMPLE" => Some(Complexity::Simple),
            "STANDARD" => Some(Complexity::Standard),
            "COMPLEX" => Some(Complexity::Complex),
            _ => None,
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 具名过程：有序步骤列表，步骤顺序必须原样保存
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Procedure {
    pub procedure_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<String>,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub rule_ids: Vec<String>,
}

impl Procedure {
    pub fn new(
        procedure_id: impl Into<String>,
        name: impl Into<String>,
        steps: Vec<String>,
    ) -> Self {
        Self {
            procedure_id: procedure_id.into(),
            name: name.into(),
            description: String::new(),
            steps,
            complexity: Complexity::default(),
            rule_ids: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_rule_ids(mut self, rule_ids: Vec<String>) -> Self {
        self.rule_ids = rule_ids;
        self
    }

    pub fn step(&self, index: usize) -> Option<&str> {
        self.steps.get(index).map(String::as_str)
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

/// 规则：ID + 自由文本
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    pub text: String,
}

impl Rule {
    pub fn new(rule_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            text: text.into(),
        }
    }
}
