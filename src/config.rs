//! Configuration loading and validation.
//!
//! Static, load-once settings live on [`Config`]. Settings that may change
//! while the orchestrator is running (retry knobs, timeouts) are wrapped in
//! `arc_swap::ArcSwap` on [`RuntimeConfig`] so updates propagate without a
//! restart, the same split the teacher crate makes between `Config` and
//! `AgentDeps::runtime_config`.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;

/// Top-level NanoClaw configuration, loaded once at startup from environment
/// variables (see `SPEC_FULL.md` §6 for the full recognized list).
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: std::path::PathBuf,
    pub runtime: RuntimeConfig,
}

/// Hot-reloadable scheduler/backend knobs.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Global concurrency cap across all chats.
    pub max_concurrent_containers: usize,
    /// Maximum consecutive failures before a group's queue is exhausted.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub retry_base_delay: Duration,
    /// If > 0, clamps the exhaustion cursor to `now - gate`.
    pub recovery_exhausted_gate: Duration,
    pub container_timeout: Duration,
    pub container_startup_timeout: Duration,
    pub idle_timeout: Duration,
    pub container_max_output_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_containers: 2,
            max_retries: 5,
            retry_base_delay: Duration::from_secs(5),
            recovery_exhausted_gate: Duration::from_secs(0),
            container_timeout: Duration::from_secs(600),
            container_startup_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            container_max_output_size: 10 * 1024 * 1024,
        }
    }
}

impl RuntimeConfig {
    /// Per-session wall-clock timeout: `max(configured timeout, idle + 30s)`.
    pub fn session_timeout(&self, group_timeout: Option<Duration>) -> Duration {
        let configured = group_timeout.unwrap_or(self.container_timeout);
        configured.max(self.idle_timeout + Duration::from_secs(30))
    }

    fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = env_usize("MAX_CONCURRENT_CONTAINERS")? {
            cfg.max_concurrent_containers = v;
        }
        if let Some(v) = env_u32("MAX_RETRIES")? {
            cfg.max_retries = v;
        }
        if let Some(v) = env_u64("RETRY_BASE_DELAY_MS")? {
            cfg.retry_base_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("RECOVERY_EXHAUSTED_GATE_MS")? {
            cfg.recovery_exhausted_gate = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("CONTAINER_TIMEOUT")? {
            cfg.container_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("CONTAINER_STARTUP_TIMEOUT")? {
            cfg.container_startup_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("IDLE_TIMEOUT")? {
            cfg.idle_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_usize("CONTAINER_MAX_OUTPUT_SIZE")? {
            cfg.container_max_output_size = v;
        }

        Ok(cfg)
    }
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{key} must be a non-negative integer")).into()),
        Err(_) => Ok(None),
    }
}

fn env_u32(key: &str) -> Result<Option<u32>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{key} must be a non-negative integer")).into()),
        Err(_) => Ok(None),
    }
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{key} must be a non-negative integer")).into()),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables, creating the data
    /// directory if it doesn't already exist.
    pub fn load() -> Result<Self> {
        let data_dir = std::env::var("NANOCLAW_DATA_DIR")
            .map(std::path::PathBuf::from)
            .or_else(|_| {
                dirs::data_dir()
                    .map(|d| d.join("nanoclaw"))
                    .context("failed to resolve a platform data directory")
                    .map_err(anyhow::Error::from)
            })
            .unwrap_or_else(|_| std::path::PathBuf::from("./data"));

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

        Ok(Self {
            data_dir,
            runtime: RuntimeConfig::from_env()?,
        })
    }

    pub fn sqlite_path(&self) -> std::path::PathBuf {
        self.data_dir.join("nanoclaw.db")
    }

    pub fn groups_root(&self) -> std::path::PathBuf {
        self.data_dir.join("groups")
    }

    pub fn ipc_root(&self) -> std::path::PathBuf {
        self.data_dir.join("ipc")
    }
}

/// Hot-swappable wrapper shared across the orchestrator, queue, and backends.
pub type SharedRuntimeConfig = Arc<ArcSwap<RuntimeConfig>>;

pub fn shared(runtime: RuntimeConfig) -> SharedRuntimeConfig {
    Arc::new(ArcSwap::from_pointee(runtime))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_timeout_floors_at_idle_plus_30s() {
        let cfg = RuntimeConfig {
            idle_timeout: Duration::from_secs(120),
            container_timeout: Duration::from_secs(60),
            ..RuntimeConfig::default()
        };
        assert_eq!(cfg.session_timeout(None), Duration::from_secs(150));
    }

    #[test]
    fn session_timeout_uses_configured_when_larger() {
        let cfg = RuntimeConfig {
            idle_timeout: Duration::from_secs(30),
            container_timeout: Duration::from_secs(600),
            ..RuntimeConfig::default()
        };
        assert_eq!(
            cfg.session_timeout(Some(Duration::from_secs(900))),
            Duration::from_secs(900)
        );
    }
}
