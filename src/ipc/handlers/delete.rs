//! `edit` / `delete` tasks: both mutate a previously-sent message and so
//! carry the same message-reference validation gate as reactions.

use crate::ipc::handlers::{extra_i64, extra_str};
use crate::ipc::task::{TaskContext, TaskHandler};
use crate::ipc::IpcTask;
use crate::error::{IpcError, Result};
use crate::guard::ReferenceMode;
use crate::{Jid, OutboundResponse, RegisteredGroup};
use async_trait::async_trait;
use tracing::warn;

fn reference_mode(task: &IpcTask) -> ReferenceMode {
    match extra_str(&task.extra, "referenceMode") {
        Some("exact") => ReferenceMode::Exact,
        Some("own") => ReferenceMode::Own,
        _ => ReferenceMode::Own,
    }
}

pub struct EditHandler;

#[async_trait]
impl TaskHandler for EditHandler {
    fn task_type(&self) -> &'static str {
        "edit"
    }

    async fn handle(&self, ctx: &TaskContext, _source_group: &RegisteredGroup, task: IpcTask) -> Result<()> {
        let chat_jid_raw = task.chat_jid.as_deref().ok_or_else(|| IpcError::TaskRejected {
            reason: "edit requires chatJid".to_string(),
        })?;
        let chat_jid = Jid::new(chat_jid_raw);
        let text = extra_str(&task.extra, "text")
            .ok_or_else(|| IpcError::TaskRejected {
                reason: "edit requires text".to_string(),
            })?
            .to_string();
        let target_author = extra_str(&task.extra, "targetAuthor");
        let target_timestamp = extra_i64(&task.extra, "targetTimestamp");

        let Some(matched) = ctx
            .resolve_reference(&chat_jid, reference_mode(&task), target_author, target_timestamp)
            .await?
        else {
            warn!(chat_jid = %chat_jid, target_author, target_timestamp, "edit target did not resolve, task rejected");
            return Ok(());
        };

        (ctx.outbound)(
            chat_jid,
            OutboundResponse::Edit {
                target_author: Some(matched.sender.clone()),
                target_timestamp: matched.source_timestamp.unwrap_or_default().to_string(),
                text,
            },
        )
        .await
    }
}

pub struct DeleteHandler;

#[async_trait]
impl TaskHandler for DeleteHandler {
    fn task_type(&self) -> &'static str {
        "delete"
    }

    async fn handle(&self, ctx: &TaskContext, _source_group: &RegisteredGroup, task: IpcTask) -> Result<()> {
        let chat_jid_raw = task.chat_jid.as_deref().ok_or_else(|| IpcError::TaskRejected {
            reason: "delete requires chatJid".to_string(),
        })?;
        let chat_jid = Jid::new(chat_jid_raw);
        let target_author = extra_str(&task.extra, "targetAuthor");
        let target_timestamp = extra_i64(&task.extra, "targetTimestamp");

        let Some(matched) = ctx
            .resolve_reference(&chat_jid, reference_mode(&task), target_author, target_timestamp)
            .await?
        else {
            warn!(chat_jid = %chat_jid, target_author, target_timestamp, "delete target did not resolve, task rejected");
            return Ok(());
        };

        (ctx.outbound)(
            chat_jid,
            OutboundResponse::Delete {
                target_author: Some(matched.sender.clone()),
                target_timestamp: matched.source_timestamp.unwrap_or_default().to_string(),
            },
        )
        .await
    }
}
