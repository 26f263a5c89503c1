//! 会话监管：取消令牌
//!
//! 持有根 CancellationToken，Ctrl+C 时取消全部 Agent；每个 Agent 另有子 token，可单独取消。

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
    agents: Mutex<HashMap<String, CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            agents: Mutex::new(HashMap::new()),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 取消全部 Agent
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// 某个 Agent 的子 token；已取消的 token 会被替换为新的
    pub fn agent_token(&self, agent_id: &str) -> CancellationToken {
        let mut agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        let token = agents
            .entry(agent_id.to_string())
            .or_insert_with(|| self.cancel_token.child_token());
        if token.is_cancelled() && !self.cancel_token.is_cancelled() {
            *token = self.cancel_token.child_token();
        }
        token.clone()
    }

    /// 只取消某个 Agent
    pub fn cancel_agent(&self, agent_id: &str) {
        let agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = agents.get(agent_id) {
            token.cancel();
        }
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
