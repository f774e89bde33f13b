//! `schedule_task` task: park a follow-up prompt until a future `runAt`,
//! rather than acting on the chat immediately. The orchestrator's scheduler
//! loop (not this handler) is what eventually drives the agent; this
//! handler only validates and persists the request.

use crate::error::{IpcError, Result};
use crate::ipc::handlers::extra_str;
use crate::ipc::task::{TaskContext, TaskHandler};
use crate::ipc::IpcTask;
use crate::store::ScheduledTask;
use crate::{Jid, RegisteredGroup};
use async_trait::async_trait;
use chrono::Utc;

pub struct ScheduleTaskHandler;

#[async_trait]
impl TaskHandler for ScheduleTaskHandler {
    fn task_type(&self) -> &'static str {
        "schedule_task"
    }

    async fn handle(&self, ctx: &TaskContext, source_group: &RegisteredGroup, task: IpcTask) -> Result<()> {
        let chat_jid = task
            .chat_jid
            .clone()
            .unwrap_or_else(|| source_group.jid.as_str().to_string());
        let prompt = extra_str(&task.extra, "prompt")
            .ok_or_else(|| IpcError::TaskRejected {
                reason: "schedule_task requires prompt".to_string(),
            })?
            .to_string();
        let run_at_raw = extra_str(&task.extra, "runAt").ok_or_else(|| IpcError::TaskRejected {
            reason: "schedule_task requires runAt".to_string(),
        })?;
        let run_at = chrono::DateTime::parse_from_rfc3339(run_at_raw)
            .map_err(|source| IpcError::TaskRejected {
                reason: format!("runAt is not a valid RFC 3339 timestamp: {source}"),
            })?
            .with_timezone(&Utc);

        let folder = ctx
            .group_store
            .get(&Jid::new(chat_jid.clone()))
            .await?
            .map(|group| group.folder)
            .unwrap_or_else(|| source_group.folder.clone());

        ctx.scheduled_store
            .schedule(ScheduledTask {
                id: uuid::Uuid::new_v4().to_string(),
                chat_jid: Jid::new(chat_jid),
                folder,
                prompt,
                run_at,
                created_at: Utc::now(),
            })
            .await?;

        Ok(())
    }
}
