//! `send_message` task: agent-originated outbound text, routed through the
//! owning channel without any message-reference gate.

use crate::ipc::handlers::extra_str;
use crate::ipc::task::{TaskContext, TaskHandler};
use crate::ipc::IpcTask;
use crate::error::{IpcError, Result};
use crate::{Jid, OutboundResponse, RegisteredGroup};
use async_trait::async_trait;

pub struct SendMessageHandler;

#[async_trait]
impl TaskHandler for SendMessageHandler {
    fn task_type(&self) -> &'static str {
        "send_message"
    }

    async fn handle(&self, ctx: &TaskContext, source_group: &RegisteredGroup, task: IpcTask) -> Result<()> {
        let chat_jid = task
            .chat_jid
            .as_deref()
            .ok_or_else(|| IpcError::TaskRejected {
                reason: "send_message requires chatJid".to_string(),
            })?;
        let text = extra_str(&task.extra, "text")
            .ok_or_else(|| IpcError::TaskRejected {
                reason: "send_message requires text".to_string(),
            })?
            .to_string();

        (ctx.outbound)(Jid::new(chat_jid), OutboundResponse::Text(text)).await?;

        if let Some(response_id) = &task.response_id {
            let namespace = ctx.namespace(&source_group.folder);
            let body = serde_json::json!({ "timestamp": chrono::Utc::now().timestamp() });
            let encoded = serde_json::to_vec(&body).map_err(|source| crate::error::Error::Other(source.into()))?;
            namespace.write_response(response_id, &encoded).await?;
        }
        Ok(())
    }
}
