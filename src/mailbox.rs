//! 信箱接口
//!
//! 引擎只通过该 trait 收发消息，不关心具体存储格式；宿主可接入文件、邮件等实现。
//! 这里提供一个进程内实现。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MailboxError {
    #[error("Mailbox unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub from: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

impl MailMessage {
    pub fn new(from: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            body: body.into(),
            sent_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn send(&self, agent_id: &str, message: MailMessage) -> Result<(), MailboxError>;

    /// 未读消息，按到达顺序
    async fn poll_unread(&self, agent_id: &str) -> Result<Vec<MailMessage>, MailboxError>;

    /// 将当前所有消息标记为已读
    async fn mark_read(&self, agent_id: &str) -> Result<(), MailboxError>;
}

#[derive(Default)]
pub struct InMemoryMailbox {
    /// agent_id -> (消息, 是否已读)
    boxes: RwLock<HashMap<String, Vec<(MailMessage, bool)>>>,
}

impl InMemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// 全部消息（含已读）
    pub async fn messages(&self, agent_id: &str) -> Vec<MailMessage> {
        self.boxes
            .read()
            .await
            .get(agent_id)
            .map(|m| m.iter().map(|(msg, _)| msg.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Mailbox for InMemoryMailbox {
    async fn send(&self, agent_id: &str, message: MailMessage) -> Result<(), MailboxError> {
        self.boxes
            .write()
            .await
            .entry(agent_id.to_string())
            .or_default()
            .push((message, false));
        Ok(())
    }

    async fn poll_unread(&self, agent_id: &str) -> Result<Vec<MailMessage>, MailboxError> {
        Ok(self
            .boxes
            .read()
            .await
            .get(agent_id)
            .map(|m| {
                m.iter()
                    .filter(|(_, read)| !read)
                    .map(|(msg, _)| msg.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_read(&self, agent_id: &str) -> Result<(), MailboxError> {
        if let Some(messages) = self.boxes.write().await.get_mut(agent_id) {
            for (_, read) in messages.iter_mut() {
                *read = true;
            }
        }
        Ok(())
    }
}
