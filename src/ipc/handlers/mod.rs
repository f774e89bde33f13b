//! Built-in IPC task handlers, one file per task type, mirroring the
//! teacher's `tools/` layout (one file per tool).

pub mod delete;
pub mod poll;
pub mod reaction;
pub mod register_chat;
pub mod schedule_task;
pub mod send_message;

use super::task::TaskHandler;
use std::sync::Arc;

/// The handler set every orchestrator wires into its [`super::task::TaskWatcher`].
pub fn default_handlers() -> Vec<Arc<dyn TaskHandler>> {
    vec![
        Arc::new(send_message::SendMessageHandler),
        Arc::new(reaction::ReactionHandler { remove: false }),
        Arc::new(reaction::ReactionHandler { remove: true }),
        Arc::new(delete::EditHandler),
        Arc::new(delete::DeleteHandler),
        Arc::new(register_chat::RegisterChatHandler),
        Arc::new(poll::PollHandler),
        Arc::new(schedule_task::ScheduleTaskHandler),
    ]
}

/// Parse an optional `i64` out of a task's flattened `extra` map.
pub(super) fn extra_i64(extra: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<i64> {
    extra.get(key).and_then(|v| v.as_i64())
}

pub(super) fn extra_str<'a>(extra: &'a serde_json::Map<String, serde_json::Value>, key: &str) -> Option<&'a str> {
    extra.get(key).and_then(|v| v.as_str())
}
