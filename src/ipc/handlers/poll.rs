//! `poll` task: channel-specific action creating a poll/survey in a chat.
//! No message reference to validate — unlike react/edit/delete, a poll
//! creates a new message rather than acting on an existing one.

use crate::ipc::handlers::extra_str;
use crate::ipc::task::{TaskContext, TaskHandler};
use crate::ipc::IpcTask;
use crate::error::{IpcError, Result};
use crate::{Jid, OutboundResponse, RegisteredGroup};
use async_trait::async_trait;

pub struct PollHandler;

#[async_trait]
impl TaskHandler for PollHandler {
    fn task_type(&self) -> &'static str {
        "poll"
    }

    async fn handle(&self, ctx: &TaskContext, _source_group: &RegisteredGroup, task: IpcTask) -> Result<()> {
        let chat_jid = task
            .chat_jid
            .as_deref()
            .ok_or_else(|| IpcError::TaskRejected {
                reason: "poll requires chatJid".to_string(),
            })?;
        let question = extra_str(&task.extra, "question")
            .ok_or_else(|| IpcError::TaskRejected {
                reason: "poll requires question".to_string(),
            })?
            .to_string();
        let options: Vec<String> = task
            .extra
            .get("options")
            .and_then(|v| v.as_array())
            .map(|values| values.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        if options.len() < 2 {
            return Err(IpcError::TaskRejected {
                reason: "poll requires at least two options".to_string(),
            }
            .into());
        }

        (ctx.outbound)(Jid::new(chat_jid), OutboundResponse::Poll { question, options }).await
    }
}
