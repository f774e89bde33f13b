//! Wires channels, the group queue, the backend registry, and the IPC task
//! watcher together into one running system.
//!
//! Grounded on `main.rs`'s top-level wiring of `MessagingManager` and
//! `AgentDeps`, and on `daemon.rs`'s shutdown-signal handling
//! (`tokio::select!` over a `watch::Receiver<bool>`, the same shape
//! `daemon.rs::start_ipc_server` uses).

use crate::backend::{AgentInput, BackendRegistry};
use crate::channel::{Channel, ChannelOpts, OnChatMetadata, OnMessage, OnRecovery};
use crate::config::SharedRuntimeConfig;
use crate::error::{ChannelError, Result};
use crate::ipc::handlers::default_handlers;
use crate::ipc::task::{OutboundSender, TaskContext, TaskWatcher};
use crate::parser::AgentOutputStatus;
use crate::queue::{ExhaustionDropFn, GroupQueue, GroupStatus, ProcessFn};
use crate::store::{GroupStore, MessageStore, RecentMessagesSnapshot, ScheduledTaskStore};
use crate::{InboundMessage, Jid, Message, OutboundResponse, RegisteredGroup};

use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// `findChannel(channels, jid) = first c where c.ownsJid(jid)` (spec §4.6).
/// Every outbound path — direct replies, scheduled tasks, IPC-originated
/// messages — goes through this single lookup.
pub fn find_channel(channels: &[Arc<dyn Channel>], jid: &Jid) -> Option<Arc<dyn Channel>> {
    channels.iter().find(|c| c.owns_jid(jid)).cloned()
}

/// Build the [`OutboundSender`] shared by the IPC task watcher and the
/// group session runner, so neither holds a direct per-channel reference.
pub fn make_outbound(channels: Vec<Arc<dyn Channel>>) -> OutboundSender {
    Arc::new(move |jid: Jid, response: OutboundResponse| {
        let channels = channels.clone();
        Box::pin(async move {
            let channel = find_channel(&channels, &jid)
                .ok_or_else(|| ChannelError::NoOwner(jid.to_string()))?;
            channel.send(&jid, response).await?;
            Ok(())
        }) as BoxFuture<'static, Result<()>>
    })
}

pub struct Orchestrator {
    channels: Vec<Arc<dyn Channel>>,
    queue: Arc<GroupQueue>,
    backends: Arc<BackendRegistry>,
    group_store: Arc<dyn GroupStore>,
    message_store: Arc<dyn MessageStore>,
    scheduled_store: Arc<dyn ScheduledTaskStore>,
    task_watcher: Arc<TaskWatcher>,
    scheduled_flags: Arc<RwLock<HashSet<Jid>>>,
}

impl Orchestrator {
    pub fn new(
        channels: Vec<Arc<dyn Channel>>,
        backends: Arc<BackendRegistry>,
        group_store: Arc<dyn GroupStore>,
        message_store: Arc<dyn MessageStore>,
        scheduled_store: Arc<dyn ScheduledTaskStore>,
        runtime_config: SharedRuntimeConfig,
        ipc_root: PathBuf,
    ) -> Arc<Self> {
        let outbound = make_outbound(channels.clone());
        let session_ids: Arc<RwLock<HashMap<Jid, String>>> = Arc::new(RwLock::new(HashMap::new()));
        let scheduled_flags: Arc<RwLock<HashSet<Jid>>> = Arc::new(RwLock::new(HashSet::new()));

        let process_fn: ProcessFn = {
            let backends = backends.clone();
            let group_store = group_store.clone();
            let message_store = message_store.clone();
            let outbound = outbound.clone();
            let session_ids = session_ids.clone();
            let scheduled_flags = scheduled_flags.clone();
            Arc::new(move |jid: Jid, cancel: CancellationToken| {
                let backends = backends.clone();
                let group_store = group_store.clone();
                let message_store = message_store.clone();
                let outbound = outbound.clone();
                let session_ids = session_ids.clone();
                let scheduled_flags = scheduled_flags.clone();
                Box::pin(async move {
                    run_group_session(
                        jid,
                        backends,
                        group_store,
                        message_store,
                        outbound,
                        session_ids,
                        scheduled_flags,
                        cancel,
                    )
                    .await
                }) as BoxFuture<'static, bool>
            })
        };

        let on_exhaustion_drop: ExhaustionDropFn = {
            let message_store = message_store.clone();
            let runtime_config = runtime_config.clone();
            Arc::new(move |jid: Jid| {
                let message_store = message_store.clone();
                let runtime_config = runtime_config.clone();
                Box::pin(async move {
                    // Advance the exhaustion cursor so the offending messages
                    // aren't retried forever (spec §4.4/§8 scenario 3). The
                    // scheduler already reset pending_messages/retry_count
                    // before invoking this hook (queue's invariant (d)).
                    let now = chrono::Utc::now();
                    let latest_ts = match message_store.latest(&jid).await {
                        Ok(Some(message)) => message.timestamp,
                        Ok(None) => now,
                        Err(error) => {
                            error!(%error, %jid, "failed to load latest message for exhaustion cursor commit");
                            now
                        }
                    };
                    let gate = runtime_config.load().recovery_exhausted_gate;
                    let cursor = if gate.is_zero() { latest_ts } else { latest_ts.max(now - gate) };
                    warn!(%jid, %cursor, "group exhausted retries, committing exhaustion cursor");
                    if let Err(error) = message_store.commit_cursor(&jid, cursor).await {
                        error!(%error, %jid, "failed to commit exhaustion cursor");
                    }
                }) as BoxFuture<'static, ()>
            })
        };

        let queue = GroupQueue::new(runtime_config, process_fn, on_exhaustion_drop);

        let task_context = Arc::new(TaskContext {
            group_store: group_store.clone(),
            message_store: message_store.clone(),
            scheduled_store: scheduled_store.clone(),
            ipc_root,
            outbound,
        });
        let task_watcher = Arc::new(TaskWatcher::new(
            task_context,
            default_handlers(),
            Duration::from_millis(500),
        ));

        Arc::new(Self {
            channels,
            queue,
            backends,
            group_store,
            message_store,
            scheduled_store,
            task_watcher,
            scheduled_flags,
        })
    }

    pub fn find_channel(&self, jid: &Jid) -> Option<Arc<dyn Channel>> {
        find_channel(&self.channels, jid)
    }

    /// `getAvailableGroups()`: registered chats whose JID some connected
    /// channel actually owns (spec §4.6).
    pub async fn get_available_groups(&self) -> Result<Vec<RegisteredGroup>> {
        let groups = self.group_store.list().await?;
        Ok(groups.into_iter().filter(|g| self.find_channel(&g.jid).is_some()).collect())
    }

    /// Shared `channelOpts.onMessage`: persist the inbound message, then
    /// enqueue the chat if the message actually triggers the agent.
    pub fn on_message(self: &Arc<Self>) -> OnMessage {
        let this = self.clone();
        Arc::new(move |inbound: InboundMessage| {
            let this = this.clone();
            Box::pin(async move { this.handle_inbound(inbound).await })
        })
    }

    async fn handle_inbound(&self, inbound: InboundMessage) {
        let message = Message {
            id: inbound.id.clone(),
            chat_jid: inbound.chat_jid.clone(),
            sender: inbound.sender_id.clone(),
            sender_name: inbound.sender_name.clone(),
            content: inbound.content.clone(),
            timestamp: inbound.timestamp,
            source_timestamp: inbound.source_timestamp,
            is_from_me: inbound.is_from_me,
            is_bot: inbound.is_bot,
        };
        if let Err(error) = self.message_store.append(&message).await {
            error!(%error, chat_jid = %inbound.chat_jid, "failed to persist inbound message");
        }

        if inbound.is_from_me {
            return;
        }

        let group = match self.group_store.get(&inbound.chat_jid).await {
            Ok(Some(group)) => group,
            Ok(None) => return,
            Err(error) => {
                error!(%error, chat_jid = %inbound.chat_jid, "failed to look up registered group");
                return;
            }
        };

        let triggered = group.is_main() || !group.requires_trigger || group.trigger.is_match(&inbound.content);
        if !triggered {
            return;
        }

        self.queue.enqueue(inbound.chat_jid).await;
    }

    /// Shared `channelOpts.onRecovery`: a channel whose watchdog just
    /// reconnected may have missed messages, so re-enqueue every chat it
    /// owns that went stale during the outage.
    pub fn on_recovery(self: &Arc<Self>) -> OnRecovery {
        let this = self.clone();
        Arc::new(move |channel_name: &'static str| {
            let this = this.clone();
            Box::pin(async move {
                info!(channel = channel_name, "channel recovered, re-enqueueing its idle chats");
                this.queue.recover(move |jid| jid.scheme() == channel_name).await;
            })
        })
    }

    /// Shared `channelOpts.onChatMetadata`: chat discovery is surfaced for
    /// operator registration tooling; auto-registration is explicitly out
    /// of scope (`register_chat` is an explicit, main-group-only IPC task).
    pub fn on_chat_metadata(&self) -> OnChatMetadata {
        Arc::new(move |jid, seen_at, name, scheme, is_group| {
            info!(%jid, %seen_at, name, scheme, is_group, "chat metadata observed");
        })
    }

    pub fn channel_opts(self: &Arc<Self>) -> ChannelOpts {
        ChannelOpts {
            on_message: self.on_message(),
            on_chat_metadata: self.on_chat_metadata(),
            on_recovery: self.on_recovery(),
        }
    }

    /// Bring every distinct referenced backend and every channel online,
    /// start the IPC task watcher, then block until `shutdown` fires and
    /// drain in-flight work before tearing everything back down.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let groups = self.group_store.list().await?;
        let mut seen_backends = HashSet::new();
        for group in &groups {
            let name = group.backend.as_deref().unwrap_or("local");
            if seen_backends.insert(name.to_string()) {
                match self.backends.get(Some(name)) {
                    Ok(backend) => {
                        if let Err(error) = backend.initialize().await {
                            error!(%error, backend = name, "backend failed to initialize");
                        }
                    }
                    Err(error) => warn!(%error, backend = name, "group references unknown backend"),
                }
            }
        }

        for channel in &self.channels {
            if let Err(error) = channel.connect().await {
                error!(%error, channel = channel.name(), "channel failed to connect");
            }
        }

        let watcher = self.task_watcher.clone();
        let watcher_shutdown = shutdown.clone();
        tokio::spawn(async move { watcher.run(watcher_shutdown).await });

        let scheduler = self.clone();
        let scheduler_shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run_scheduled_task_loop(scheduler_shutdown).await });

        let _ = shutdown.changed().await;
        info!("shutdown signal received, draining group queue");
        self.drain(Duration::from_secs(10)).await;

        for channel in &self.channels {
            if let Err(error) = channel.disconnect().await {
                warn!(%error, channel = channel.name(), "channel failed to disconnect cleanly");
            }
        }
        for name in self.backends.names() {
            if let Ok(backend) = self.backends.get(Some(name)) {
                let _ = backend.shutdown().await;
            }
        }

        Ok(())
    }

    async fn drain(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.all_groups_settled().await || tokio::time::Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Poll for due `schedule_task` entries and feed each one into the same
    /// per-chat queue a live inbound message would use, so scheduled work
    /// still obeys the one-agent-per-chat invariant and backoff policy.
    async fn run_scheduled_task_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.dispatch_due_scheduled_tasks().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn dispatch_due_scheduled_tasks(&self) {
        let due = match self.scheduled_store.due(chrono::Utc::now()).await {
            Ok(due) => due,
            Err(error) => {
                warn!(%error, "failed to poll due scheduled tasks");
                return;
            }
        };

        for task in due {
            let message = Message {
                id: format!("scheduled:{}", task.id),
                chat_jid: task.chat_jid.clone(),
                sender: "scheduler".to_string(),
                sender_name: "Scheduled task".to_string(),
                content: task.prompt.clone(),
                timestamp: chrono::Utc::now(),
                source_timestamp: None,
                is_from_me: false,
                is_bot: true,
            };
            if let Err(error) = self.message_store.append(&message).await {
                error!(%error, id = %task.id, "failed to persist scheduled task prompt as a message");
                continue;
            }
            if let Err(error) = self.scheduled_store.remove(&task.id).await {
                warn!(%error, id = %task.id, "failed to remove dispatched scheduled task");
            }

            self.scheduled_flags.write().await.insert(task.chat_jid.clone());
            self.queue.enqueue(task.chat_jid).await;
        }
    }

    async fn all_groups_settled(&self) -> bool {
        let groups = match self.group_store.list().await {
            Ok(groups) => groups,
            Err(_) => return true,
        };
        for group in &groups {
            if let Some(state) = self.queue.state_of(&group.jid).await {
                if !matches!(state.status, GroupStatus::Idle | GroupStatus::Exhausted) {
                    return false;
                }
            }
        }
        true
    }
}

/// One coalesced run of the scheduler's `processMessagesFn(jid)`: drain every
/// message buffered since the chat's exhaustion cursor, snapshot recent
/// history into the group's IPC namespace, run the agent on its registered
/// backend, then route any resulting text back out through the owning
/// channel. On success the cursor advances to the last drained message.
async fn run_group_session(
    jid: Jid,
    backends: Arc<BackendRegistry>,
    group_store: Arc<dyn GroupStore>,
    message_store: Arc<dyn MessageStore>,
    outbound: OutboundSender,
    session_ids: Arc<RwLock<HashMap<Jid, String>>>,
    scheduled_flags: Arc<RwLock<HashSet<Jid>>>,
    cancel: CancellationToken,
) -> bool {
    let group = match group_store.get(&jid).await {
        Ok(Some(group)) => group,
        Ok(None) => {
            warn!(%jid, "group session requested for an unregistered chat, dropping");
            return true;
        }
        Err(error) => {
            error!(%error, %jid, "failed to load registered group for session run");
            return false;
        }
    };

    let backend_name = group.backend.as_deref().unwrap_or("local");
    let backend = match backends.get(group.backend.as_deref()) {
        Ok(backend) => backend,
        Err(error) => {
            error!(%error, %jid, backend = backend_name, "unknown backend for group");
            return false;
        }
    };

    // Drain every message buffered since the chat's exhaustion cursor in one
    // invocation (spec §5's FIFO-with-coalescing guarantee); an empty batch
    // means the cursor has already caught up with the latest message, i.e.
    // "nothing to do", which the scheduler treats as success.
    let cursor = match message_store.cursor(&jid).await {
        Ok(cursor) => cursor,
        Err(error) => {
            error!(%error, %jid, "failed to load exhaustion cursor for session run");
            return false;
        }
    };
    let buffered = match message_store.since_cursor(&jid, cursor).await {
        Ok(messages) => messages,
        Err(error) => {
            error!(%error, %jid, "failed to load buffered messages for session run");
            return false;
        }
    };
    let Some(last) = buffered.last().cloned() else { return true };
    let prompt = if buffered.len() == 1 {
        buffered[0].content.clone()
    } else {
        buffered
            .iter()
            .map(|m| format!("{}: {}", m.sender_name, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let snapshot = match message_store.recent_snapshot(&jid, 50).await {
        Ok(snapshot) => snapshot,
        Err(error) => {
            error!(%error, %jid, "failed to build recent-messages snapshot");
            RecentMessagesSnapshot { messages: Vec::new(), last_sync: chrono::Utc::now() }
        }
    };
    if let Ok(bytes) = serde_json::to_vec(&snapshot) {
        if let Err(error) = backend.write_ipc_data(&group.folder, "recent_messages.json", &bytes).await {
            warn!(%error, %jid, "failed to write recent_messages.json snapshot");
        }
    }

    let session_id = session_ids.read().await.get(&jid).cloned();
    let is_scheduled_task = scheduled_flags.write().await.remove(&jid);
    let input = AgentInput {
        prompt,
        session_id,
        group_folder: group.folder.clone(),
        chat_jid: jid.as_str().to_string(),
        chat_name: Some(group.display_name.clone()),
        is_main: group.is_main(),
        is_scheduled_task,
    };

    let cancel_for_process = cancel.clone();
    let on_process: crate::backend::OnProcess = Box::new(move |handle| {
        tokio::spawn(async move {
            cancel_for_process.cancelled().await;
            handle.kill().await;
        });
    });

    let output = match backend.run_agent(&group, input, on_process, None).await {
        Ok(output) => output,
        Err(error) => {
            error!(%error, %jid, "backend run_agent returned an error");
            return false;
        }
    };

    if let Some(new_session_id) = output.new_session_id.clone() {
        session_ids.write().await.insert(jid.clone(), new_session_id);
    }

    match output.status {
        AgentOutputStatus::Success => {
            if let Err(error) = message_store.commit_cursor(&jid, last.timestamp).await {
                error!(%error, %jid, "failed to commit cursor after successful session");
            }
            if let Some(text) = output.result.filter(|text| !text.trim().is_empty()) {
                if let Err(error) = outbound(jid.clone(), OutboundResponse::Text(text)).await {
                    error!(%error, %jid, "failed to send agent response through owning channel");
                }
            }
            true
        }
        AgentOutputStatus::Error => {
            warn!(%jid, error = output.error.as_deref().unwrap_or("unknown"), "agent session ended in error");
            false
        }
    }
}
