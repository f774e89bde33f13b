//! `react` / `remove_reaction` tasks: both carry a message reference that
//! must resolve per §4.3's three-mode validation before the reaction is
//! sent to the channel.

use crate::ipc::handlers::{extra_i64, extra_str};
use crate::ipc::task::{TaskContext, TaskHandler};
use crate::ipc::IpcTask;
use crate::error::{IpcError, Result};
use crate::guard::ReferenceMode;
use crate::{Jid, OutboundResponse, RegisteredGroup};
use async_trait::async_trait;
use tracing::warn;

/// Handles both `react` and `remove_reaction`; `remove` selects which.
pub struct ReactionHandler {
    pub remove: bool,
}

#[async_trait]
impl TaskHandler for ReactionHandler {
    fn task_type(&self) -> &'static str {
        if self.remove {
            "remove_reaction"
        } else {
            "react"
        }
    }

    async fn handle(&self, ctx: &TaskContext, _source_group: &RegisteredGroup, task: IpcTask) -> Result<()> {
        let chat_jid_raw = task.chat_jid.as_deref().ok_or_else(|| IpcError::TaskRejected {
            reason: format!("{} requires chatJid", self.task_type()),
        })?;
        let chat_jid = Jid::new(chat_jid_raw);
        let emoji = extra_str(&task.extra, "emoji")
            .ok_or_else(|| IpcError::TaskRejected {
                reason: format!("{} requires emoji", self.task_type()),
            })?
            .to_string();
        let target_author = extra_str(&task.extra, "targetAuthor");
        let target_timestamp = extra_i64(&task.extra, "targetTimestamp");
        let mode = reference_mode(&task);

        let Some(matched) = ctx
            .resolve_reference(&chat_jid, mode, target_author, target_timestamp)
            .await?
        else {
            warn!(
                task_type = %self.task_type(),
                chat_jid = %chat_jid,
                target_author,
                target_timestamp,
                "message reference did not resolve, task rejected"
            );
            return Ok(());
        };

        let target_timestamp = matched.source_timestamp.unwrap_or_default().to_string();
        let response = if self.remove {
            OutboundResponse::RemoveReaction {
                target_author: Some(matched.sender.clone()),
                target_timestamp,
                emoji,
            }
        } else {
            OutboundResponse::Reaction {
                target_author: Some(matched.sender.clone()),
                target_timestamp,
                emoji,
            }
        };

        (ctx.outbound)(chat_jid, response).await
    }
}

/// `referenceMode` on the task overrides the default (`any`); recognized
/// values are `"exact"`, `"own"`, `"any"`.
fn reference_mode(task: &IpcTask) -> ReferenceMode {
    match extra_str(&task.extra, "referenceMode") {
        Some("exact") => ReferenceMode::Exact,
        Some("own") => ReferenceMode::Own,
        _ => ReferenceMode::Any,
    }
}
