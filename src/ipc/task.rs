//! Task watcher: polls each registered group's `tasks/` directory and
//! dispatches task JSON to the matching handler, subject to per-group
//! authorization.
//!
//! Grounded on `cron/scheduler.rs::start_timer`'s `tokio::time::interval`
//! ticker (`MissedTickBehavior::Skip`-style skip-if-busy via an
//! `AtomicBool` guard) and on `messaging/manager.rs`'s flat adapter map,
//! generalized here to a `HashMap<&'static str, Arc<dyn TaskHandler>>`
//! dispatch table — the same one-handler-per-type layout `tools.rs` uses
//! for one-file-per-tool.

use super::{IpcNamespace, IpcTask};
use crate::guard::{self, ReferenceMode};
use crate::store::{GroupStore, MessageStore, ScheduledTaskStore};
use crate::{Jid, Message, RegisteredGroup};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Dispatches a validated, authorized task to its channel-facing effect.
pub type OutboundSender =
    Arc<dyn Fn(Jid, crate::OutboundResponse) -> BoxFuture<'static, crate::error::Result<()>> + Send + Sync>;

/// Shared context every task handler gets, so handlers stay free functions
/// of `(&TaskContext, &RegisteredGroup, IpcTask)` rather than owning state.
pub struct TaskContext {
    pub group_store: Arc<dyn GroupStore>,
    pub message_store: Arc<dyn MessageStore>,
    pub scheduled_store: Arc<dyn ScheduledTaskStore>,
    pub ipc_root: PathBuf,
    pub outbound: OutboundSender,
}

impl TaskContext {
    pub fn namespace(&self, folder: &str) -> IpcNamespace {
        IpcNamespace::new(&self.ipc_root, folder)
    }

    /// Resolve and validate a message reference per §4.3's three modes.
    /// Returns the matched message, or `None` (and logs nothing itself —
    /// callers log the specific rejection reason).
    pub async fn resolve_reference(
        &self,
        chat_jid: &Jid,
        mode: ReferenceMode,
        target_author: Option<&str>,
        target_timestamp: Option<i64>,
    ) -> crate::error::Result<Option<Message>> {
        let candidate = match target_timestamp {
            Some(ts) => self.message_store.get_by_source_timestamp(chat_jid, ts).await?,
            None => self.message_store.latest(chat_jid).await?,
        };

        let matched = candidate.filter(|message| {
            let author_ok = target_author.is_none_or(|author| message.sender == author);
            author_ok && guard::validate_reference(mode, Some(message))
        });
        Ok(matched)
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    fn task_type(&self) -> &'static str;

    async fn handle(
        &self,
        ctx: &TaskContext,
        source_group: &RegisteredGroup,
        task: IpcTask,
    ) -> crate::error::Result<()>;
}

pub struct TaskWatcher {
    context: Arc<TaskContext>,
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
    poll_interval: Duration,
    busy: Arc<AtomicBool>,
}

impl TaskWatcher {
    pub fn new(context: Arc<TaskContext>, handlers: Vec<Arc<dyn TaskHandler>>, poll_interval: Duration) -> Self {
        let handlers = handlers.into_iter().map(|h| (h.task_type(), h)).collect();
        Self {
            context,
            handlers,
            poll_interval,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the watcher loop until `shutdown` resolves.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.busy.swap(true, Ordering::AcqRel) {
                        continue;
                    }
                    self.scan_once().await;
                    self.busy.store(false, Ordering::Release);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn scan_once(&self) {
        let groups = match self.context.group_store.list().await {
            Ok(groups) => groups,
            Err(source) => {
                warn!(error = %source, "failed to list registered groups for task scan");
                return;
            }
        };

        for group in groups {
            let namespace = self.context.namespace(&group.folder);
            let tasks_dir = namespace.tasks_dir();
            let mut entries = match tokio::fs::read_dir(&tasks_dir).await {
                Ok(entries) => entries,
                Err(source) if source.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    warn!(folder = %group.folder, error = %source, "failed to scan tasks directory");
                    continue;
                }
            };

            let mut paths = Vec::new();
            loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => paths.push(entry.path()),
                    Ok(None) => break,
                    Err(source) => {
                        warn!(folder = %group.folder, error = %source, "error iterating tasks directory");
                        break;
                    }
                }
            }

            for path in paths {
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                self.process_one(&group, &path).await;
            }
        }
    }

    async fn process_one(&self, group: &RegisteredGroup, path: &std::path::Path) {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => return,
            Err(source) => {
                warn!(path = %path.display(), error = %source, "failed to read task file");
                return;
            }
        };
        // Process-once: remove immediately so a slow handler never sees it twice.
        let _ = tokio::fs::remove_file(path).await;

        let task: IpcTask = match serde_json::from_slice(&raw) {
            Ok(task) => task,
            Err(source) => {
                warn!(path = %path.display(), error = %source, "malformed task JSON, discarding");
                return;
            }
        };

        if let Some(chat_jid) = &task.chat_jid {
            let target = Jid::new(chat_jid.as_str());
            if !guard::is_authorized_target(group, &target) {
                warn!(
                    source_folder = %group.folder,
                    chat_jid = %chat_jid,
                    task_type = %task.task_type,
                    "task rejected: source group is not authorized to target this chat"
                );
                return;
            }
        } else if !group.is_main() {
            warn!(
                source_folder = %group.folder,
                task_type = %task.task_type,
                "task rejected: missing chatJid from non-main group"
            );
            return;
        }

        let Some(handler) = self.handlers.get(task.task_type.as_str()).cloned() else {
            warn!(task_type = %task.task_type, "no handler registered for task type");
            return;
        };

        debug!(folder = %group.folder, task_type = %task.task_type, "dispatching IPC task");
        if let Err(source) = handler.handle(&self.context, group, task).await {
            warn!(folder = %group.folder, error = %source, "task handler failed");
        }
    }
}
