//! 对话记录（Transcript）
//!
//! AgentState 中保存的有序 role/content 消息；超出上限时丢弃最旧的部分。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 追加一条消息；`max_entries` 为 0 表示不限制
pub fn push_bounded(messages: &mut Vec<Message>, msg: Message, max_entries: usize) {
    messages.push(msg);
    if max_entries > 0 && messages.len() > max_entries {
        let excess = messages.len() - max_entries;
        messages.drain(..excess);
    }
}

/// 最后一条 Assistant 回复之后的 User 消息（尚未被回应的输入）
pub fn pending_user_messages(messages: &[Message]) -> Vec<&Message> {
    let start = messages
        .iter()
        .rposition(|m| m.role == Role::Assistant)
        .map(|i| i + 1)
        .unwrap_or(0);
    messages[start..]
        .iter()
        .filter(|m| m.role == Role::User)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_bounded_drops_oldest() {
        let mut messages = Vec::new();
        for i in 0..5 {
            push_bounded(&mut messages, Message::assistant(format!("m{i}")), 3);
        }
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_push_bounded_zero_is_unbounded() {
        let mut messages = Vec::new();
        for _ in 0..10 {
            push_bounded(&mut messages, Message::user("x"), 0);
        }
        assert_eq!(messages.len(), 10);
    }

    #[test]
    fn test_pending_user_messages() {
        let messages = vec![
            Message::user("old"),
            Message::assistant("reply"),
            Message::user("new 1"),
            Message::user("new 2"),
        ];
        let pending = pending_user_messages(&messages);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].content, "new 1");
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::assistant("hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }
}
