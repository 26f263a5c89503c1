//! 记忆层：对话记录（Transcript）、记忆条目、相关度检索

pub mod conversation;
pub mod entry;
pub mod search;

pub use conversation::{pending_user_messages, push_bounded, Message, Role};
pub use entry::{MemoryEntry, MemoryQuery, MemoryRecord, MemoryType};
pub use search::rank_memories;
