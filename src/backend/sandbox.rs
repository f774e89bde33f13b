//! Persistent remote sandbox backend (Sprites/Daytona-style): a long-lived
//! remote workspace that is provisioned once per group and then reused
//! across invocations, with the local workspace synced up by content hash
//! so unchanged files are never re-uploaded.
//!
//! The content-hash cache is original to this expansion (no direct teacher
//! counterpart — see `DESIGN.md`), but the hashing primitive itself is the
//! teacher's own `sha2` dependency, the same one `agent/ingestion.rs` uses
//! for `content_hash(content: &str) -> String`. The provisioning marker is
//! an idempotent "create if absent" check, the same shape as
//! `daemon.rs`'s PID-file existence check before daemonizing.

use super::{AgentInput, Backend, OnOutput, OnProcess, ProcessHandle};
use crate::config::SharedRuntimeConfig;
use crate::error::{BackendError, Result};
use crate::parser::{AgentOutput, AgentOutputStatus, OutputEvent, OutputParser, TimeoutOutcome};
use crate::RegisteredGroup;
use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// One provisioned remote workspace.
#[derive(Debug, Clone)]
struct SandboxSession {
    remote_id: String,
    /// relative path -> last-synced content hash.
    synced_files: HashMap<PathBuf, String>,
}

pub struct SandboxBackend {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    groups_root: PathBuf,
    runtime_config: SharedRuntimeConfig,
    sessions: RwLock<HashMap<String, SandboxSession>>,
}

impl SandboxBackend {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        groups_root: PathBuf,
        runtime_config: SharedRuntimeConfig,
    ) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            groups_root,
            runtime_config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    async fn ensure_provisioned(&self, folder: &str) -> Result<String> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(folder) {
                return Ok(session.remote_id.clone());
            }
        }

        let resp = self
            .client
            .post(format!("{}/sandboxes", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "label": folder }))
            .send()
            .await
            .map_err(|source| BackendError::InitFailed(source.to_string()))?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|source| BackendError::InitFailed(source.to_string()))?;
        let remote_id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BackendError::InitFailed("sandbox create response missing id".into()))?
            .to_string();

        info!(folder, remote_id, "provisioned remote sandbox");
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            folder.to_string(),
            SandboxSession {
                remote_id: remote_id.clone(),
                synced_files: HashMap::new(),
            },
        );
        Ok(remote_id)
    }

    /// Walk the local workspace and upload any file whose content hash
    /// differs from what was last synced.
    async fn sync_workspace(&self, folder: &str, remote_id: &str) -> Result<()> {
        let root = self.groups_root.join(folder);
        if !root.exists() {
            return Ok(());
        }
        let mut to_upload = Vec::new();
        walk_files(&root, &root, &mut to_upload).await?;

        let mut uploaded = HashMap::new();
        for relative in to_upload {
            let absolute = root.join(&relative);
            let data = tokio::fs::read(&absolute).await?;
            let hash = content_hash(&data);

            let already_synced = {
                let sessions = self.sessions.read().await;
                sessions
                    .get(folder)
                    .and_then(|s| s.synced_files.get(&relative))
                    .map(|h| h == &hash)
                    .unwrap_or(false)
            };
            if already_synced {
                uploaded.insert(relative, hash);
                continue;
            }

            self.client
                .put(format!(
                    "{}/sandboxes/{remote_id}/files/{}",
                    self.base_url,
                    relative.display()
                ))
                .bearer_auth(&self.api_key)
                .body(data)
                .send()
                .await
                .map_err(|source| BackendError::Other(source.into()))?;
            debug!(folder, path = %relative.display(), "synced file to remote sandbox");
            uploaded.insert(relative, hash);
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(folder) {
            session.synced_files.extend(uploaded);
        }
        Ok(())
    }
}

fn walk_files<'a>(
    root: &'a Path,
    dir: &'a Path,
    out: &'a mut Vec<PathBuf>,
) -> futures::future::BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                walk_files(root, &path, out).await?;
            } else if file_type.is_file() {
                if let Ok(relative) = path.strip_prefix(root) {
                    out.push(relative.to_path_buf());
                }
            }
        }
        Ok(())
    })
}

#[async_trait]
impl Backend for SandboxBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_agent(
        &self,
        group: &RegisteredGroup,
        input: AgentInput,
        on_process: OnProcess,
        on_output: Option<OnOutput>,
    ) -> Result<AgentOutput> {
        let runtime = self.runtime_config.load();
        let timeout = runtime.session_timeout(
            group
                .container
                .as_ref()
                .and_then(|c| c.timeout_secs)
                .map(Duration::from_secs),
        );
        let max_bytes = runtime.container_max_output_size;

        let remote_id = self.ensure_provisioned(&group.folder).await?;
        self.sync_workspace(&group.folder, &remote_id).await?;

        let resp = self
            .client
            .post(format!("{}/sandboxes/{remote_id}/exec", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&input)
            .send()
            .await
            .map_err(|source| BackendError::Spawn(source.to_string()))?;

        on_process(ProcessHandle::new(remote_id.clone(), {
            let client = self.client.clone();
            let base_url = self.base_url.clone();
            let api_key = self.api_key.clone();
            let remote_id = remote_id.clone();
            move || {
                let client = client.clone();
                let base_url = base_url.clone();
                let api_key = api_key.clone();
                let remote_id = remote_id.clone();
                Box::pin(async move {
                    let _ = client
                        .post(format!("{base_url}/sandboxes/{remote_id}/exec/cancel"))
                        .bearer_auth(&api_key)
                        .send()
                        .await;
                })
            }
        }));

        let mut parser = OutputParser::new(max_bytes, runtime.container_startup_timeout, runtime.idle_timeout);
        let mut stream = resp.bytes_stream();
        let overall_deadline = tokio::time::sleep(timeout);
        tokio::pin!(overall_deadline);
        let mut ticker = tokio::time::interval(Duration::from_millis(200));

        let final_output = loop {
            tokio::select! {
                biased;
                _ = &mut overall_deadline => {
                    warn!(remote_id, "sandbox session exceeded overall timeout");
                    break timeout_output(TimeoutOutcome::ErrorNull);
                }
                _ = ticker.tick() => {
                    if let Some(outcome) = parser.check_timeout(tokio::time::Instant::now()) {
                        break timeout_output(outcome);
                    }
                }
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            for event in parser.feed_stdout(&bytes) {
                                if let OutputEvent::Output(ref output) = event {
                                    if let Some(cb) = &on_output {
                                        let guard = parser.output_chain().begin();
                                        let cb = cb.clone();
                                        let output = output.clone();
                                        tokio::spawn(async move {
                                            cb(output).await;
                                            drop(guard);
                                        });
                                    }
                                }
                            }
                        }
                        Some(Err(source)) => {
                            warn!(remote_id, error = %source, "sandbox exec stream error");
                            break parser.parse_final_output().unwrap_or_else(|| timeout_output(TimeoutOutcome::ErrorNull));
                        }
                        None => {
                            break parser.parse_final_output().unwrap_or_else(|| timeout_output(TimeoutOutcome::ErrorNull));
                        }
                    }
                }
            }
        };

        parser.output_chain().join().await;
        Ok(final_output)
    }

    async fn send_message(&self, folder: &str, text: &str) -> Result<bool> {
        let Some(remote_id) = self.sessions.read().await.get(folder).map(|s| s.remote_id.clone()) else {
            return Ok(false);
        };
        self.client
            .post(format!("{}/sandboxes/{remote_id}/input", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|source| BackendError::Other(source.into()))?;
        Ok(true)
    }

    async fn close_stdin(&self, folder: &str, _subdir: Option<&str>) -> Result<()> {
        if let Some(remote_id) = self.sessions.read().await.get(folder).map(|s| s.remote_id.clone()) {
            let _ = self
                .client
                .post(format!("{}/sandboxes/{remote_id}/input/close", self.base_url))
                .bearer_auth(&self.api_key)
                .send()
                .await;
        }
        Ok(())
    }

    async fn write_ipc_data(&self, folder: &str, filename: &str, data: &[u8]) -> Result<()> {
        let remote_id = self.ensure_provisioned(folder).await?;
        self.client
            .put(format!("{}/sandboxes/{remote_id}/ipc/{filename}", self.base_url))
            .bearer_auth(&self.api_key)
            .body(data.to_vec())
            .send()
            .await
            .map_err(|source| BackendError::Other(source.into()))?;
        Ok(())
    }

    async fn read_file(&self, folder: &str, relative_path: &str) -> Result<Vec<u8>> {
        let remote_id = self.ensure_provisioned(folder).await?;
        let resp = self
            .client
            .get(format!("{}/sandboxes/{remote_id}/files/{relative_path}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|source| BackendError::Other(source.into()))?;
        Ok(resp.bytes().await.map_err(|source| BackendError::Other(source.into()))?.to_vec())
    }

    async fn write_file(&self, folder: &str, relative_path: &str, data: &[u8]) -> Result<()> {
        let remote_id = self.ensure_provisioned(folder).await?;
        self.client
            .put(format!("{}/sandboxes/{remote_id}/files/{relative_path}", self.base_url))
            .bearer_auth(&self.api_key)
            .body(data.to_vec())
            .send()
            .await
            .map_err(|source| BackendError::Other(source.into()))?;
        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        self.client
            .get(format!("{}/health", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|source| BackendError::InitFailed(source.to_string()))?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            let _ = self
                .client
                .delete(format!("{}/sandboxes/{}", self.base_url, session.remote_id))
                .bearer_auth(&self.api_key)
                .send()
                .await;
        }
        Ok(())
    }
}

fn timeout_output(outcome: TimeoutOutcome) -> AgentOutput {
    match outcome {
        TimeoutOutcome::SuccessNull => AgentOutput {
            status: AgentOutputStatus::Success,
            result: None,
            new_session_id: None,
            error: None,
        },
        TimeoutOutcome::ErrorNull => AgentOutput {
            status: AgentOutputStatus::Error,
            result: None,
            new_session_id: None,
            error: Some("agent session timed out".to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_for_identical_bytes() {
        assert_eq!(content_hash(b"hello"), content_hash(b"hello"));
        assert_ne!(content_hash(b"hello"), content_hash(b"world"));
    }
}
