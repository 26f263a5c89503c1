//! 执行状态：阶段、校验状态与每个 Agent 的 AgentState
//!
//! AgentState 每个 (agent_id, user_id) 恰好一份，每次阶段转换后整体覆盖写入 Store。
//! 临时数据是显式的类型化字段；Agent 自定义数据放在 `extensions` 里。

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::memory::{push_bounded, Message};
use crate::store::Procedure;

/// 执行阶段（封闭枚举，转换规则见 PhaseRunner）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentPhase {
    #[default]
    Planning,
    Executing,
    Verifying,
    Sleeping,
}

impl AgentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentPhase::Planning => "PLANNING",
            AgentPhase::Executing => "EXECUTING",
            AgentPhase::Verifying => "VERIFYING",
            AgentPhase::Sleeping => "SLEEPING",
        }
    }

    /// 合法的下一阶段；Sleeping 之后只能由重新分配过程回到 Planning
    pub fn successors(&self) -> &'static [AgentPhase] {
        match self {
            AgentPhase::Planning => &[AgentPhase::Planning, AgentPhase::Executing],
            AgentPhase::Executing => &[
                AgentPhase::Executing,
                AgentPhase::Verifying,
                AgentPhase::Planning,
            ],
            AgentPhase::Verifying => &[
                AgentPhase::Sleeping,
                AgentPhase::Executing,
                AgentPhase::Planning,
            ],
            AgentPhase::Sleeping => &[AgentPhase::Sleeping],
        }
    }

    pub fn can_transition_to(&self, next: AgentPhase) -> bool {
        self.successors().contains(&next)
    }
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Pending,
    Success,
    Failure,
}

pub const DEFAULT_EMOTIONAL_STATE: &str = "neutral";

fn default_emotional_state() -> String {
    DEFAULT_EMOTIONAL_STATE.to_string()
}

/// 可恢复的执行状态
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub user_id: String,
    pub phase: AgentPhase,
    /// 当前过程 ID；None 表示空闲
    pub active_procedure: Option<String>,
    /// 0 起始的步骤指针，指向 procedure_snapshot 中的步骤
    pub step_index: usize,
    pub validation_status: Option<ValidationStatus>,
    #[serde(default = "default_emotional_state")]
    pub emotional_state: String,
    /// 分配过程时的快照；之后对 Store 中该过程的修改不影响本次执行
    #[serde(default)]
    pub procedure_snapshot: Option<Procedure>,
    #[serde(default)]
    pub last_procedure: Option<String>,
    /// 连续校验失败次数
    #[serde(default)]
    pub verification_failures: u32,
    #[serde(default)]
    pub transcript: Vec<Message>,
    #[serde(default)]
    pub extensions: Map<String, Value>,
}

impl AgentState {
    pub fn new(agent_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            user_id: user_id.into(),
            phase: AgentPhase::Planning,
            active_procedure: None,
            step_index: 0,
            validation_status: None,
            emotional_state: default_emotional_state(),
            procedure_snapshot: None,
            last_procedure: None,
            verification_failures: 0,
            transcript: Vec::new(),
            extensions: Map::new(),
        }
    }

    pub fn with_emotional_state(mut self, emotional_state: impl Into<String>) -> Self {
        self.emotional_state = emotional_state.into();
        self
    }

    /// 分配新过程：记录快照，指针归零，回到 Planning
    pub fn assign(&mut self, procedure: Procedure) {
        self.active_procedure = Some(procedure.procedure_id.clone());
        self.procedure_snapshot = Some(procedure);
        self.step_index = 0;
        self.validation_status = Some(ValidationStatus::Pending);
        self.verification_failures = 0;
        self.phase = AgentPhase::Planning;
    }

    /// 放弃当前过程
    pub fn clear_procedure(&mut self) {
        self.active_procedure = None;
        self.procedure_snapshot = None;
        self.step_index = 0;
    }

    pub fn record(&mut self, msg: Message, max_entries: usize) {
        push_bounded(&mut self.transcript, msg, max_entries);
    }

    /// 快照与 active_procedure 一致时返回快照
    pub fn snapshot(&self) -> Option<&Procedure> {
        match (&self.active_procedure, &self.procedure_snapshot) {
            (Some(id), Some(p)) if *id == p.procedure_id => Some(p),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.phase == AgentPhase::Planning && self.active_procedure.is_none()
    }
}
