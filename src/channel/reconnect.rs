//! Shared reconnect watchdog for channel adapters backed by a persistent
//! connection (gateway socket, websocket, long-poll loop).
//!
//! Grounded on `cron/scheduler.rs`'s consecutive-failure counter plus
//! `examples/other_examples/22d51a37_kojira-localgpt__src-discord-mod.rs.rs`'s
//! doubling reconnect loop; the jitter math itself is shared with
//! `queue::backoff` rather than re-derived here.

use crate::queue::backoff::jittered_delay;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Tuning knobs for one adapter's watchdog.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// How often the watchdog polls `is_connected`.
    pub check_interval: Duration,
    /// Base delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Hard ceiling on the backed-off delay, regardless of attempt count.
    pub max_delay: Duration,
    /// Consecutive failures (`maxAttempts`) before the breaker opens. Spec
    /// §4.5/§7 mark this fatal: the watchdog logs `breaker_open` and exits
    /// the process for a supervisor to restart, rather than backing off
    /// forever against a dead upstream.
    pub breaker_threshold: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            breaker_threshold: 5,
        }
    }
}

/// Watches a channel adapter's connection state and drives reconnection
/// attempts with backoff, tripping a breaker after sustained failure so a
/// dead upstream doesn't spin the process in a hot loop.
pub struct Reconnector {
    policy: ReconnectPolicy,
    consecutive_failures: AtomicU32,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Run the watchdog until `shutdown` reports `true`.
    ///
    /// `is_connected` and `connect` are polled/invoked synchronously from the
    /// watchdog's own task; callers should make both cheap (an atomic flag
    /// check and a bounded async dial respectively).
    pub async fn run<IsConnected, Connect, ConnectFut>(
        self: Arc<Self>,
        channel_name: &'static str,
        is_connected: IsConnected,
        connect: Connect,
        on_recovery: super::OnRecovery,
        mut shutdown: watch::Receiver<bool>,
    ) where
        IsConnected: Fn() -> bool + Send + Sync + 'static,
        Connect: Fn() -> ConnectFut + Send + Sync + 'static,
        ConnectFut: std::future::Future<Output = crate::error::Result<()>> + Send + 'static,
    {
        let mut ticker = tokio::time::interval(self.policy.check_interval);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(channel = channel_name, "reconnect watchdog shutting down");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if is_connected() {
                        continue;
                    }

                    let attempt = self.consecutive_failures.load(Ordering::SeqCst) + 1;
                    if attempt > self.policy.breaker_threshold {
                        warn!(channel = channel_name, attempt, "breaker_open: max reconnect attempts exceeded, exiting");
                        std::process::exit(1);
                    }
                    let delay = jittered_delay(attempt, self.policy.base_delay).min(self.policy.max_delay);
                    warn!(channel = channel_name, attempt, ?delay, "channel disconnected, scheduling reconnect");
                    tokio::time::sleep(delay).await;

                    match connect().await {
                        Ok(()) => {
                            let had_failed = self.consecutive_failures.swap(0, Ordering::SeqCst) > 0;
                            info!(channel = channel_name, "reconnect succeeded");
                            if had_failed {
                                on_recovery(channel_name).await;
                            }
                        }
                        Err(error) => {
                            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                            warn!(channel = channel_name, %error, failures, "reconnect attempt failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn succeeds_immediately_when_already_connected() {
        let policy = ReconnectPolicy {
            check_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let reconnector = Arc::new(Reconnector::new(policy));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let handle = tokio::spawn(reconnector.run(
            "test",
            || true,
            move || {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            Arc::new(|_name: &'static str| Box::pin(async {})),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reconnects_and_reports_recovery_after_failure() {
        let policy = ReconnectPolicy {
            check_interval: Duration::from_millis(5),
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            breaker_threshold: 10,
        };
        let reconnector = Arc::new(Reconnector::new(policy));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));
        let recovered = Arc::new(AtomicBool::new(false));
        let connected_check = connected.clone();
        let connected_effect = connected.clone();
        let recovered_clone = recovered.clone();

        let handle = tokio::spawn(reconnector.run(
            "test",
            move || connected_check.load(Ordering::SeqCst),
            move || {
                connected_effect.store(true, Ordering::SeqCst);
                async { Ok(()) }
            },
            Arc::new(move |_name: &'static str| {
                let flag = recovered_clone.clone();
                Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                })
            }),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(connected.load(Ordering::SeqCst));
        assert!(!recovered.load(Ordering::SeqCst), "first successful connect is not a recovery");
    }
}
