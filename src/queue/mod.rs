//! Per-chat work queue and scheduler.
//!
//! `GroupQueue` enforces the two concurrency invariants: at most one agent
//! session per chat JID, and at most `MAX_CONCURRENT_CONTAINERS` sessions
//! globally. Retry/backoff and the consecutive-failure circuit breaker are
//! grounded on `cron/scheduler.rs::Scheduler` (its `consecutive_failures`
//! counter and `ExecutionGuard` RAII drop-guard become `retry_count` and the
//! semaphore permit held across a run).

pub mod backoff;

use crate::config::SharedRuntimeConfig;
use crate::Jid;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Scheduler state for one registered chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Idle,
    Pending,
    Active,
    Backoff,
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct GroupState {
    pub status: GroupStatus,
    pub pending_messages: bool,
    pub retry_count: u32,
    cancel_token: Option<CancellationToken>,
}

impl GroupState {
    fn idle() -> Self {
        Self {
            status: GroupStatus::Idle,
            pending_messages: false,
            retry_count: 0,
            cancel_token: None,
        }
    }
}

/// `processMessagesFn(jid) -> bool`: drains buffered messages for the chat.
/// `true` means success (including "nothing to do"); `false` is a failure.
/// The `CancellationToken` is cancelled by [`GroupQueue::abort`].
pub type ProcessFn = Arc<dyn Fn(Jid, CancellationToken) -> BoxFuture<'static, bool> + Send + Sync>;

/// Invoked when a chat's retries are exhausted; its job is to advance the
/// chat's "last processed" cursor so offending messages are not retried
/// forever.
pub type ExhaustionDropFn = Arc<dyn Fn(Jid) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct GroupQueue {
    states: RwLock<HashMap<Jid, GroupState>>,
    semaphore: Arc<Semaphore>,
    runtime_config: SharedRuntimeConfig,
    process_fn: ProcessFn,
    on_exhaustion_drop: ExhaustionDropFn,
}

impl GroupQueue {
    pub fn new(
        runtime_config: SharedRuntimeConfig,
        process_fn: ProcessFn,
        on_exhaustion_drop: ExhaustionDropFn,
    ) -> Arc<Self> {
        let max_concurrent = runtime_config.load().max_concurrent_containers;
        Arc::new(Self {
            states: RwLock::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            runtime_config,
            process_fn,
            on_exhaustion_drop,
        })
    }

    /// Coalescing enqueue: if the chat is already active/pending/backing off,
    /// just flags pending work; otherwise schedules a run.
    pub async fn enqueue(self: &Arc<Self>, jid: Jid) {
        let should_spawn = {
            let mut states = self.states.write().await;
            let state = states.entry(jid.clone()).or_insert_with(GroupState::idle);
            match state.status {
                GroupStatus::Active | GroupStatus::Pending | GroupStatus::Backoff => {
                    state.pending_messages = true;
                    false
                }
                GroupStatus::Idle | GroupStatus::Exhausted => {
                    state.status = GroupStatus::Pending;
                    true
                }
            }
        };

        if should_spawn {
            self.spawn_run(jid);
        }
    }

    /// Re-enqueue every idle chat matching `owned_by`, per a channel recovery signal.
    pub async fn recover(self: &Arc<Self>, owned_by: impl Fn(&Jid) -> bool) {
        let to_run: Vec<Jid> = {
            let mut states = self.states.write().await;
            states
                .iter_mut()
                .filter(|(jid, state)| state.status == GroupStatus::Idle && owned_by(jid))
                .map(|(jid, state)| {
                    state.status = GroupStatus::Pending;
                    jid.clone()
                })
                .collect()
        };

        for jid in to_run {
            info!(%jid, "recovery signal re-enqueuing chat");
            self.spawn_run(jid);
        }
    }

    /// Cancel the in-flight session for `jid`, if any, and clear pending work.
    pub async fn abort(&self, jid: &Jid) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(jid) {
            if let Some(token) = state.cancel_token.take() {
                token.cancel();
            }
            state.pending_messages = false;
        }
    }

    pub async fn state_of(&self, jid: &Jid) -> Option<GroupState> {
        self.states.read().await.get(jid).cloned()
    }

    fn spawn_run(self: &Arc<Self>, jid: Jid) {
        let queue = self.clone();
        tokio::spawn(async move {
            queue.run_once(jid).await;
        });
    }

    async fn run_once(self: Arc<Self>, jid: Jid) {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let token = CancellationToken::new();
        {
            let mut states = self.states.write().await;
            let state = states.entry(jid.clone()).or_insert_with(GroupState::idle);
            state.status = GroupStatus::Active;
            state.cancel_token = Some(token.clone());
        }

        debug!(%jid, "group session starting");
        let succeeded = (self.process_fn)(jid.clone(), token).await;
        drop(permit);

        if succeeded {
            self.on_success(jid).await;
        } else {
            self.on_failure(jid).await;
        }
    }

    async fn on_success(self: &Arc<Self>, jid: Jid) {
        let (had_pending, status) = {
            let mut states = self.states.write().await;
            let state = states.entry(jid.clone()).or_insert_with(GroupState::idle);
            state.retry_count = 0;
            state.cancel_token = None;
            let had_pending = state.pending_messages;
            state.pending_messages = false;
            state.status = if had_pending {
                GroupStatus::Pending
            } else {
                GroupStatus::Idle
            };
            (had_pending, state.status)
        };

        debug!(%jid, ?status, "group session succeeded");
        if had_pending {
            self.spawn_run(jid);
        }
    }

    async fn on_failure(self: &Arc<Self>, jid: Jid) {
        let max_retries = self.runtime_config.load().max_retries;
        let base_delay = self.runtime_config.load().retry_base_delay;

        let attempt = {
            let mut states = self.states.write().await;
            let state = states.entry(jid.clone()).or_insert_with(GroupState::idle);
            state.cancel_token = None;
            state.retry_count += 1;
            state.retry_count
        };

        if attempt > max_retries {
            warn!(%jid, attempt, max_retries, "group exhausted retries, committing exhaustion cursor");
            {
                let mut states = self.states.write().await;
                if let Some(state) = states.get_mut(&jid) {
                    state.status = GroupStatus::Exhausted;
                }
            }
            (self.on_exhaustion_drop)(jid.clone()).await;
            let mut states = self.states.write().await;
            if let Some(state) = states.get_mut(&jid) {
                state.pending_messages = false;
                state.retry_count = 0;
                state.status = GroupStatus::Idle;
            }
            return;
        }

        {
            let mut states = self.states.write().await;
            if let Some(state) = states.get_mut(&jid) {
                state.status = GroupStatus::Backoff;
            }
        }

        let delay = backoff::jittered_delay(attempt, base_delay);
        debug!(%jid, attempt, ?delay, "group session failed, scheduling retry");

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let should_spawn = {
                let mut states = queue.states.write().await;
                if let Some(state) = states.get_mut(&jid) {
                    state.status = GroupStatus::Pending;
                    true
                } else {
                    false
                }
            };
            if should_spawn {
                queue.spawn_run(jid);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{shared, RuntimeConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_runtime_config() -> SharedRuntimeConfig {
        shared(RuntimeConfig {
            max_concurrent_containers: 2,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(5),
            ..RuntimeConfig::default()
        })
    }

    #[tokio::test]
    async fn successful_run_transitions_to_idle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let process: ProcessFn = Arc::new(move |_jid, _token| {
            let calls = calls2.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                true
            })
        });
        let drop_fn: ExhaustionDropFn = Arc::new(|_jid| Box::pin(async {}));
        let queue = GroupQueue::new(test_runtime_config(), process, drop_fn);

        queue.enqueue(Jid::new("slack:C1")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let state = queue.state_of(&Jid::new("slack:C1")).await.unwrap();
        assert_eq!(state.status, GroupStatus::Idle);
        assert_eq!(state.retry_count, 0);
    }

    #[tokio::test]
    async fn enqueue_while_active_coalesces_into_one_more_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let process: ProcessFn = Arc::new(move |_jid, _token| {
            let calls = calls2.clone();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                calls.fetch_add(1, Ordering::SeqCst);
                true
            })
        });
        let drop_fn: ExhaustionDropFn = Arc::new(|_jid| Box::pin(async {}));
        let queue = GroupQueue::new(test_runtime_config(), process, drop_fn);

        let jid = Jid::new("slack:C1");
        queue.enqueue(jid.clone()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.enqueue(jid.clone()).await; // coalesces while active
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhaustion_resets_state_after_max_retries() {
        let drop_calls = Arc::new(AtomicUsize::new(0));
        let drop_calls2 = drop_calls.clone();
        let process: ProcessFn = Arc::new(|_jid, _token| Box::pin(async { false }));
        let drop_fn: ExhaustionDropFn = Arc::new(move |_jid| {
            let drop_calls = drop_calls2.clone();
            Box::pin(async move {
                drop_calls.fetch_add(1, Ordering::SeqCst);
            })
        });
        let queue = GroupQueue::new(test_runtime_config(), process, drop_fn);

        let jid = Jid::new("slack:C1");
        queue.enqueue(jid.clone()).await;
        // max_retries=3, base delay 5ms: wait generously for all retries to exhaust.
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(drop_calls.load(Ordering::SeqCst), 1);
        let state = queue.state_of(&jid).await.unwrap();
        assert_eq!(state.status, GroupStatus::Idle);
        assert_eq!(state.retry_count, 0);
        assert!(!state.pending_messages);
    }

    #[tokio::test]
    async fn abort_cancels_token_and_clears_pending() {
        let process: ProcessFn = Arc::new(|_jid, token| {
            Box::pin(async move {
                token.cancelled().await;
                false
            })
        });
        let drop_fn: ExhaustionDropFn = Arc::new(|_jid| Box::pin(async {}));
        let queue = GroupQueue::new(test_runtime_config(), process, drop_fn);

        let jid = Jid::new("slack:C1");
        queue.enqueue(jid.clone()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.abort(&jid).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let state = queue.state_of(&jid).await.unwrap();
        assert!(!state.pending_messages);
    }
}
