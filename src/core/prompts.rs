//! 提示词构造
//!
//! system 提示词描述 Agent 的身份与当前状态；user 提示词按阶段给出具体任务。

use crate::core::AgentState;
use crate::memory::{pending_user_messages, MemoryEntry};
use crate::store::{AgentContext, Procedure};

/// 组装 system 提示词所需的人设信息
#[derive(Debug, Clone, Default)]
pub struct Persona {
    pub name: String,
    pub personality: String,
    pub rules: Vec<String>,
}

impl Persona {
    /// 没有 AgentContext 时以 agent_id 作为名字
    pub fn from_context(ctx: Option<&AgentContext>, agent_id: &str) -> Self {
        match ctx {
            Some(ctx) => Self {
                name: ctx.agent_name.clone(),
                personality: ctx.personality.clone(),
                rules: Vec::new(),
            },
            None => Self {
                name: agent_id.to_string(),
                ..Self::default()
            },
        }
    }

    pub fn with_rules(mut self, rules: Vec<String>) -> Self {
        self.rules = rules;
        self
    }
}

/// 尚未被回应的用户消息（信箱投递）附在末尾，任何阶段都能看到
pub fn system_prompt(
    persona: &Persona,
    state: &AgentState,
    procedure: Option<&Procedure>,
) -> String {
    let mut prompt = format!(
        "You are {}, currently in the {} phase. Your emotional state is: {}.",
        persona.name, state.phase, state.emotional_state
    );
    if !persona.personality.is_empty() {
        prompt.push_str(&format!("\nPersonality: {}", persona.personality));
    }
    if let Some(p) = procedure {
        prompt.push_str(&format!(
            "\nYou are executing the {} procedure, on step {} of {}.",
            p.name,
            state.step_index + 1,
            p.step_count()
        ));
    }
    if !persona.rules.is_empty() {
        prompt.push_str("\nFollow these rules:");
        for rule in &persona.rules {
            prompt.push_str(&format!("\n- {}", rule));
        }
    }
    let pending = pending_user_messages(&state.transcript);
    if !pending.is_empty() {
        prompt.push_str("\nUnread messages:");
        for msg in pending {
            prompt.push_str(&format!("\n- {}", msg.content));
        }
    }
    prompt.push_str("\nRespond in character, considering your current state and procedure.");
    prompt
}

fn numbered_steps(procedure: &Procedure) -> String {
    procedure
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| format!("{}. {}", i + 1, step))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 无过程：询问下一步
pub fn idle_prompt() -> String {
    String::from("What would you like to do next?")
}

pub fn planning_prompt(procedure: &Procedure, memories: &[MemoryEntry]) -> String {
    let mut prompt = format!("You need to execute the {} procedure.", procedure.name);
    if !procedure.description.is_empty() {
        prompt.push_str(&format!("\nDescription: {}", procedure.description));
    }
    prompt.push_str(&format!("\n\nSteps:\n{}", numbered_steps(procedure)));
    if !memories.is_empty() {
        prompt.push_str("\n\nRelevant memories:");
        for m in memories {
            prompt.push_str(&format!("\n- [{}] {}", m.memory_type, m.content));
        }
    }
    prompt.push_str("\n\nHow will you approach this procedure? Please outline your plan.");
    prompt
}

pub fn execution_prompt(procedure: &Procedure, step_index: usize, step: &str) -> String {
    format!(
        "You are executing step {} of the {} procedure: \"{}\"\n\
         Please execute this step now and describe what you did.",
        step_index + 1,
        procedure.name,
        step
    )
}

/// 确认语取自配置的成功短语，模型照做即可通过 is_success
pub fn verification_prompt(procedure: &Procedure, success_phrases: &[String]) -> String {
    let mut prompt = format!(
        "You have executed all steps of the {} procedure:\n{}\n\n\
         Please verify that each step was executed correctly.",
        procedure.name,
        numbered_steps(procedure)
    );
    if let Some(phrase) = confirmation_phrase(success_phrases) {
        prompt.push_str(&format!(
            " If everything is done, reply with the exact words \"{}\".",
            phrase
        ));
    }
    prompt
}

pub fn confirmation_phrase(success_phrases: &[String]) -> Option<&str> {
    success_phrases
        .iter()
        .map(|p| p.trim())
        .find(|p| !p.is_empty())
}

pub fn closing_line(procedure_name: Option<&str>) -> String {
    match procedure_name {
        Some(name) => format!(
            "I've successfully completed the {} procedure and saved my state. \
             I'm now in sleep mode until reactivated.",
            name
        ),
        None => "I've saved my state and I'm now in sleep mode until reactivated.".to_string(),
    }
}

/// 回复中是否包含任一成功短语（大小写不敏感）
pub fn is_success(reply: &str, phrases: &[String]) -> bool {
    let reply = reply.to_lowercase();
    phrases
        .iter()
        .any(|p| !p.is_empty() && reply.contains(&p.to_lowercase()))
}
