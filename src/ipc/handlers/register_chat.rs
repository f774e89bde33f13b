//! `register_chat` task: main-group-only admin action that adds a new
//! `RegisteredGroup` to the store.

use crate::ipc::handlers::extra_str;
use crate::ipc::task::{TaskContext, TaskHandler};
use crate::ipc::IpcTask;
use crate::error::{IpcError, Result};
use crate::{Jid, RegisteredGroup};
use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

pub struct RegisterChatHandler;

#[async_trait]
impl TaskHandler for RegisterChatHandler {
    fn task_type(&self) -> &'static str {
        "register_chat"
    }

    async fn handle(&self, ctx: &TaskContext, source_group: &RegisteredGroup, task: IpcTask) -> Result<()> {
        if !source_group.is_main() {
            warn!(source_folder = %source_group.folder, "register_chat rejected: only the main group may register new chats");
            return Ok(());
        }

        let jid = task.chat_jid.as_deref().ok_or_else(|| IpcError::TaskRejected {
            reason: "register_chat requires chatJid".to_string(),
        })?;
        let folder = extra_str(&task.extra, "folder")
            .ok_or_else(|| IpcError::TaskRejected {
                reason: "register_chat requires folder".to_string(),
            })?
            .to_string();
        let display_name = extra_str(&task.extra, "displayName").unwrap_or(jid).to_string();
        let trigger_pattern = extra_str(&task.extra, "trigger").unwrap_or("(?i)@bot");
        let trigger = Regex::new(trigger_pattern).map_err(|source| IpcError::TaskRejected {
            reason: format!("invalid trigger regex: {source}"),
        })?;

        let group = RegisteredGroup {
            jid: Jid::new(jid),
            display_name,
            folder,
            server_folder: None,
            trigger,
            requires_trigger: extra_str(&task.extra, "requiresTrigger") != Some("false"),
            added_at: chrono::Utc::now(),
            backend: extra_str(&task.extra, "backend").map(str::to_string),
            container: None,
        };

        ctx.group_store.register(group).await
    }
}
