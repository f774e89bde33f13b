//! Registered-chat and message-history storage.
//!
//! Modeled as traits (`GroupStore`, `MessageStore`) per the external
//! collaborator boundary: the crate ships one SQLite-backed implementation
//! ([`sqlite::SqliteStore`]) but callers depend on the trait objects so a
//! different storage engine can be swapped in without touching the queue
//! or IPC plane.

pub mod sqlite;

use crate::error::Result;
use crate::{Jid, Message, RegisteredGroup};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[async_trait::async_trait]
pub trait GroupStore: Send + Sync + 'static {
    /// Register a new chat, or update an existing registration for the same
    /// JID. Fails with [`crate::error::StoreError::FolderConflict`] if
    /// `folder` is already claimed by a different JID.
    async fn register(&self, group: RegisteredGroup) -> Result<()>;

    async fn get(&self, jid: &Jid) -> Result<Option<RegisteredGroup>>;

    async fn list(&self) -> Result<Vec<RegisteredGroup>>;

    async fn remove(&self, jid: &Jid) -> Result<bool>;

    /// Render the full registry as the `groups.json` IPC snapshot shape.
    async fn snapshot(&self) -> Result<Vec<RegisteredGroup>> {
        self.list().await
    }
}

#[async_trait::async_trait]
pub trait MessageStore: Send + Sync + 'static {
    async fn append(&self, message: &Message) -> Result<()>;

    /// Fetch the most recent `limit` messages for a chat, newest last.
    async fn recent(&self, chat_jid: &Jid, limit: i64) -> Result<Vec<Message>>;

    /// Look up a message by its platform-native numeric timestamp, used by
    /// `exact`-mode reference validation.
    async fn get_by_source_timestamp(
        &self,
        chat_jid: &Jid,
        source_timestamp: i64,
    ) -> Result<Option<Message>>;

    /// Most recent message in the chat, used by `any`/`own`-mode reference
    /// validation when no explicit timestamp is given.
    async fn latest(&self, chat_jid: &Jid) -> Result<Option<Message>>;

    /// The chat's exhaustion cursor: messages at or before this instant are
    /// considered already given up on (spec §4.4's "exhaustion cursor").
    /// `None` until the first exhaustion commit or explicit advance.
    async fn cursor(&self, chat_jid: &Jid) -> Result<Option<DateTime<Utc>>>;

    /// Advance the chat's exhaustion cursor. Callers are expected to only
    /// ever move it forward; the store does not enforce monotonicity itself
    /// since a single writer (the scheduler) owns each chat's cursor updates.
    async fn commit_cursor(&self, chat_jid: &Jid, cursor: DateTime<Utc>) -> Result<()>;

    /// Buffered messages strictly after `cursor` (or all messages, if
    /// `cursor` is `None`), oldest first. `processMessagesFn` drains these
    /// in one invocation per spec §5's per-chat FIFO ordering guarantee.
    async fn since_cursor(&self, chat_jid: &Jid, cursor: Option<DateTime<Utc>>) -> Result<Vec<Message>>;

    /// Build the `recent_messages.json` snapshot for a chat.
    async fn recent_snapshot(&self, chat_jid: &Jid, limit: i64) -> Result<RecentMessagesSnapshot> {
        let messages = self
            .recent(chat_jid, limit)
            .await?
            .into_iter()
            .map(RecentMessageEntry::from)
            .collect();
        Ok(RecentMessagesSnapshot {
            messages,
            last_sync: Utc::now(),
        })
    }
}

/// One entry in the `recent_messages.json` snapshot. Content is truncated to
/// 200 characters, matching the IPC snapshot contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentMessageEntry {
    pub source_timestamp: Option<i64>,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_from_me: bool,
}

const RECENT_MESSAGE_CONTENT_CAP: usize = 200;

impl From<Message> for RecentMessageEntry {
    fn from(message: Message) -> Self {
        let content = if message.content.chars().count() > RECENT_MESSAGE_CONTENT_CAP {
            message.content.chars().take(RECENT_MESSAGE_CONTENT_CAP).collect()
        } else {
            message.content
        };
        Self {
            source_timestamp: message.source_timestamp,
            sender_id: message.sender,
            sender_name: message.sender_name,
            content,
            timestamp: message.timestamp,
            is_from_me: message.is_from_me,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentMessagesSnapshot {
    pub messages: Vec<RecentMessageEntry>,
    #[serde(rename = "lastSync")]
    pub last_sync: DateTime<Utc>,
}

/// A `schedule_task` IPC request durably parked until its `run_at` fires.
/// Mirrors the shape of an inbound message closely enough that
/// `run_group_session` can treat a due task exactly like a fresh message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub chat_jid: Jid,
    pub folder: String,
    pub prompt: String,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait ScheduledTaskStore: Send + Sync + 'static {
    async fn schedule(&self, task: ScheduledTask) -> Result<()>;

    /// Tasks whose `run_at` has passed, oldest first. Does not remove them —
    /// callers must [`ScheduledTaskStore::remove`] once a task is dispatched.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>>;

    async fn remove(&self, id: &str) -> Result<()>;

    /// Pending tasks for one chat, used to render the `tasks.json` snapshot.
    async fn list_for_chat(&self, chat_jid: &Jid) -> Result<Vec<ScheduledTask>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_message_entry_truncates_content() {
        let message = Message {
            id: "1".to_string(),
            chat_jid: Jid::new("slack:C1"),
            sender: "u1".to_string(),
            sender_name: "User".to_string(),
            content: "x".repeat(250),
            timestamp: Utc::now(),
            source_timestamp: Some(42),
            is_from_me: false,
            is_bot: false,
        };
        let entry: RecentMessageEntry = message.into();
        assert_eq!(entry.content.chars().count(), RECENT_MESSAGE_CONTENT_CAP);
    }
}
