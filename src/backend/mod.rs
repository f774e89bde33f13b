//! Backend: the pluggable substrate abstraction that runs one agent
//! invocation on a specific execution environment.
//!
//! Every variant (local container, persistent remote sandbox, ephemeral
//! cloud VM) implements the same [`Backend`] trait; the observable contract
//! — exactly one `on_process` call before any `on_output`, deterministic
//! errors surfaced as `{status: "error"}`, identical IPC file operations —
//! is uniform across substrates. Object-safety is via `#[async_trait]`,
//! the same convention already established by [`crate::store::GroupStore`].

pub mod hetzner;
pub mod local;
pub mod registry;
pub mod sandbox;
pub mod vm;

use crate::error::Result;
use crate::parser::AgentOutput;
use crate::RegisteredGroup;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Agent stdin / S3 inbox payload (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct AgentInput {
    pub prompt: String,
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_name: Option<String>,
    pub is_main: bool,
    #[serde(default)]
    pub is_scheduled_task: bool,
}

/// A handle to a running agent process on some substrate, sufficient to
/// cancel it. Cheap to clone; `kill` is substrate-specific (container stop,
/// sandbox session delete, VM destroy) but always idempotent.
#[derive(Clone)]
pub struct ProcessHandle {
    name: Arc<str>,
    kill: Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>,
}

impl ProcessHandle {
    pub fn new(
        name: impl Into<Arc<str>>,
        kill: impl Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kill: Arc::new(kill),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancel the underlying substrate process. Idempotent.
    pub async fn kill(&self) {
        (self.kill)().await
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle").field("name", &self.name).finish()
    }
}

/// Invoked exactly once, strictly before the first `on_output`, once the
/// substrate process has actually been spawned.
pub type OnProcess = Box<dyn FnOnce(ProcessHandle) + Send>;

/// Invoked once per streamed output event. Absent, the backend still runs
/// to completion and returns the final output (legacy/non-streaming mode).
pub type OnOutput = Arc<dyn Fn(AgentOutput) -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Stable name this backend is registered under (`"docker"`,
    /// `"apple-container"`, `"sprites"`, `"daytona"`, `"railway"`, `"hetzner"`).
    fn name(&self) -> &str;

    /// Run one agent invocation. Calls `on_process` exactly once before any
    /// `on_output` dispatch, then returns the final output when the session
    /// ends (success, error, or timeout). Deterministic failures (spawn
    /// error, timeout, non-zero exit without stream output) are folded into
    /// an `{status: "error"}` output rather than an `Err` — `Err` is
    /// reserved for failures the caller cannot recover a partial result
    /// from (e.g. the group's workspace directory cannot be prepared).
    async fn run_agent(
        &self,
        group: &RegisteredGroup,
        input: AgentInput,
        on_process: OnProcess,
        on_output: Option<OnOutput>,
    ) -> Result<AgentOutput>;

    /// Fire-and-forget follow-up message to the in-flight agent. `false`
    /// only if the backend currently has no way to reach it (e.g. no
    /// session running for that folder).
    async fn send_message(&self, folder: &str, text: &str) -> Result<bool>;

    /// Deliver the end-of-input sentinel. `subdir` overrides the default
    /// `input/` lane (scheduled tasks use `input-task/`).
    async fn close_stdin(&self, folder: &str, subdir: Option<&str>) -> Result<()>;

    /// Place a snapshot file (`recent_messages.json`, `groups.json`,
    /// `tasks.json`) in the group's IPC namespace.
    async fn write_ipc_data(&self, folder: &str, filename: &str, data: &[u8]) -> Result<()>;

    async fn read_file(&self, folder: &str, relative_path: &str) -> Result<Vec<u8>>;

    async fn write_file(&self, folder: &str, relative_path: &str, data: &[u8]) -> Result<()>;

    /// Idempotent. May heal the underlying substrate (probe + restart).
    async fn initialize(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}
