//! Per-group IPC namespace: the filesystem contract the running agent and
//! the host use to exchange messages, tasks, responses, and snapshots.
//!
//! Atomic publish (write `<name>.tmp`, then `rename`) is grounded on
//! `daemon.rs`'s PID/socket file handling (create-then-atomic-publish), and
//! the watcher's poll loop is grounded on `cron/scheduler.rs::start_timer`'s
//! `tokio::time::interval` + `MissedTickBehavior::Skip` ticker.

pub mod handlers;
pub mod task;

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MESSAGES_DIR: &str = "messages";
pub const TASKS_DIR: &str = "tasks";
pub const INPUT_DIR: &str = "input";
pub const INPUT_TASK_DIR: &str = "input-task";
pub const RESPONSES_DIR: &str = "responses";
pub const CLOSE_SENTINEL: &str = "_close";

/// Root of one group's IPC directory tree, `<ipc_root>/<group-folder>/`.
#[derive(Debug, Clone)]
pub struct IpcNamespace {
    root: PathBuf,
}

impl IpcNamespace {
    pub fn new(ipc_root: &Path, folder: &str) -> Self {
        Self {
            root: ipc_root.join(folder),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.root.join(MESSAGES_DIR)
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join(TASKS_DIR)
    }

    pub fn input_dir(&self, subdir: Option<&str>) -> PathBuf {
        self.root.join(subdir.unwrap_or(INPUT_DIR))
    }

    pub fn responses_dir(&self) -> PathBuf {
        self.root.join(RESPONSES_DIR)
    }

    /// Create every namespace subtree. Idempotent.
    pub async fn ensure_dirs(&self) -> Result<()> {
        for subdir in [MESSAGES_DIR, TASKS_DIR, INPUT_DIR, INPUT_TASK_DIR, RESPONSES_DIR] {
            tokio::fs::create_dir_all(self.root.join(subdir)).await?;
        }
        Ok(())
    }

    /// Publish `data` at `dir/name` via write-tmp-then-rename, so readers never
    /// observe a partially-written file.
    pub async fn write_atomic(&self, dir: &Path, name: &str, data: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let target = dir.join(name);
        let tmp = dir.join(format!("{name}.tmp"));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }

    /// Write the `input/` (or `input-task/`) end-of-input sentinel.
    pub async fn close_input(&self, subdir: Option<&str>) -> Result<()> {
        self.write_atomic(&self.input_dir(subdir), CLOSE_SENTINEL, b"").await
    }

    /// Write a response file a caller polls for and then unlinks.
    pub async fn write_response(&self, response_id: &str, data: &[u8]) -> Result<()> {
        self.write_atomic(&self.responses_dir(), &format!("{response_id}.json"), data)
            .await
    }

    /// Write a response under a caller-chosen file name rather than the
    /// `<responseId>.json` convention, for handlers returning an opaque
    /// payload such as a downloaded attachment. Both conventions coexist:
    /// text-response callers poll for `<responseId>.json`, file-response
    /// callers poll for the exact name they asked for.
    pub async fn write_response_named(&self, file_name: &str, data: &[u8]) -> Result<()> {
        self.write_atomic(&self.responses_dir(), file_name, data).await
    }

    /// Refresh `recent_messages.json`, `groups.json`, `tasks.json` before an
    /// agent spawn, so the agent reads a consistent snapshot instead of
    /// querying the host live.
    pub async fn write_snapshot(&self, filename: &str, data: &[u8]) -> Result<()> {
        self.write_atomic(&self.root, filename, data).await
    }
}

/// Common IPC task envelope. `extra` carries type-specific fields the
/// open-ended handler table interprets; see `ipc::handlers`.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct IpcTask {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(rename = "chatJid", default, skip_serializing_if = "Option::is_none")]
    pub chat_jid: Option<String>,
    #[serde(rename = "responseId", default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Opaque IPC response payload; the file name is caller-chosen, so there is
/// no fixed schema beyond an optional `timestamp`.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct IpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_atomic_leaves_no_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let ns = IpcNamespace::new(dir.path(), "main");
        ns.ensure_dirs().await.unwrap();

        ns.write_atomic(&ns.tasks_dir(), "task-1.json", b"{}").await.unwrap();

        assert!(ns.tasks_dir().join("task-1.json").exists());
        assert!(!ns.tasks_dir().join("task-1.json.tmp").exists());
    }

    #[tokio::test]
    async fn close_input_writes_sentinel_in_requested_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let ns = IpcNamespace::new(dir.path(), "main");
        ns.ensure_dirs().await.unwrap();

        ns.close_input(Some(INPUT_TASK_DIR)).await.unwrap();

        assert!(ns.input_dir(Some(INPUT_TASK_DIR)).join(CLOSE_SENTINEL).exists());
        assert!(!ns.input_dir(None).join(CLOSE_SENTINEL).exists());
    }

    #[test]
    fn ipc_task_round_trips_type_specific_fields() {
        let json = serde_json::json!({
            "type": "send_message",
            "chatJid": "slack:C1",
            "timestamp": "2024-01-01T00:00:00Z",
            "text": "hello"
        });
        let task: IpcTask = serde_json::from_value(json).unwrap();
        assert_eq!(task.task_type, "send_message");
        assert_eq!(task.extra.get("text").and_then(|v| v.as_str()), Some("hello"));
    }
}
