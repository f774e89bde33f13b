//! Local container backend: runs the agent inside a `docker`/apple-container
//! container on this host.
//!
//! Grounded on `acp/process.rs::AcpProcess::spawn`/`kill` (piped I/O,
//! SIGTERM-then-SIGKILL shutdown) and `acp/worker.rs`'s single-reader-task
//! loop, adapted from a raw child process to a `bollard` container attach
//! stream since the agent now runs sandboxed rather than as a direct child.

use super::{AgentInput, Backend, OnOutput, OnProcess, ProcessHandle};
use crate::config::SharedRuntimeConfig;
use crate::error::{BackendError, Result};
use crate::parser::{OutputEvent, OutputParser, TimeoutOutcome};
use crate::RegisteredGroup;
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config as ContainerConfig, CreateContainerOptions, LogOutput,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use futures::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const WORKSPACE_MOUNT: &str = "/workspace";
const IPC_MOUNT: &str = "/ipc";

/// Runs one agent invocation per call inside a fresh container named
/// `nanoclaw-<folder>-<unix-ms>`. Containers are not reused across
/// invocations; `sessions` tracks the currently-running container per
/// group folder so `send_message`/`close_stdin` can reach it.
pub struct LocalContainerBackend {
    docker: Docker,
    image: String,
    /// `"docker"` or `"apple-container"` — selects the CLI semantics bollard
    /// talks to (apple-container speaks the same Docker Engine API on a
    /// local unix socket, so no separate client type is needed).
    name: String,
    groups_root: PathBuf,
    ipc_root: PathBuf,
    runtime_config: SharedRuntimeConfig,
    sessions: RwLock<std::collections::HashMap<String, ActiveSession>>,
}

struct ActiveSession {
    container_id: String,
    stdin: Mutex<Box<dyn tokio::io::AsyncWrite + Unpin + Send>>,
}

impl LocalContainerBackend {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        groups_root: PathBuf,
        ipc_root: PathBuf,
        runtime_config: SharedRuntimeConfig,
    ) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|source| BackendError::InitFailed(source.to_string()))?;
        Ok(Self {
            docker,
            image: image.into(),
            name: name.into(),
            groups_root,
            ipc_root,
            runtime_config,
            sessions: RwLock::new(std::collections::HashMap::new()),
        })
    }

    fn container_name(&self, folder: &str) -> String {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("nanoclaw-{folder}-{now_ms}")
    }

    fn binds(&self, group: &RegisteredGroup) -> Vec<String> {
        let workspace = self.groups_root.join(&group.folder);
        let ipc = self.ipc_root.join(&group.folder);
        let mut binds = vec![
            format!("{}:{WORKSPACE_MOUNT}:rw", workspace.display()),
            format!("{}:{IPC_MOUNT}:rw", ipc.display()),
        ];
        if let Some(container) = &group.container {
            for mount in &container.additional_mounts {
                let mode = if mount.read_only { "ro" } else { "rw" };
                binds.push(format!(
                    "{}:{}:{mode}",
                    mount.host_path.display(),
                    mount.container_path.display()
                ));
            }
        }
        binds
    }

    /// Host UID:GID to run the container as, unless the host is root or
    /// already the container's default user (UID 1000) — spec §4.2.1.
    fn user(&self) -> Option<String> {
        #[cfg(unix)]
        {
            // SAFETY: getuid/getgid never fail.
            let uid = unsafe { libc::getuid() };
            let gid = unsafe { libc::getgid() };
            if uid == 0 || uid == 1000 {
                return None;
            }
            Some(format!("{uid}:{gid}"))
        }
        #[cfg(not(unix))]
        {
            None
        }
    }
}

#[async_trait]
impl Backend for LocalContainerBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_agent(
        &self,
        group: &RegisteredGroup,
        input: AgentInput,
        on_process: OnProcess,
        on_output: Option<OnOutput>,
    ) -> Result<crate::parser::AgentOutput> {
        let runtime = self.runtime_config.load();
        let timeout = runtime.session_timeout(group.container.as_ref().and_then(|c| c.timeout_secs).map(Duration::from_secs));
        let startup_timeout = runtime.container_startup_timeout;
        let idle_timeout = runtime.idle_timeout;
        let max_bytes = runtime.container_max_output_size;

        let container_name = self.container_name(&group.folder);
        let host_config = bollard::models::HostConfig {
            binds: Some(self.binds(group)),
            ..Default::default()
        };
        let config = ContainerConfig {
            image: Some(self.image.clone()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            tty: Some(false),
            user: self.user(),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_opts = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(create_opts), config)
            .await
            .map_err(|source| BackendError::Spawn(source.to_string()))?;
        let container_id = created.id;

        self.docker
            .start_container::<String>(&container_id, None)
            .await
            .map_err(|source| BackendError::Spawn(source.to_string()))?;

        let attach_opts = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            ..Default::default()
        };
        let attached = self
            .docker
            .attach_container(&container_id, Some(attach_opts))
            .await
            .map_err(|source| BackendError::Spawn(source.to_string()))?;

        let mut stdin = attached.input;
        let payload = serde_json::to_vec(&input).map_err(|source| BackendError::Spawn(source.to_string()))?;
        let _ = stdin.write_all(&payload).await;
        let _ = stdin.write_all(b"\n").await;

        info!(container = %container_name, folder = %group.folder, "started local container session");
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(
                group.folder.clone(),
                ActiveSession {
                    container_id: container_id.clone(),
                    stdin: Mutex::new(Box::new(stdin)),
                },
            );
        }

        let docker = self.docker.clone();
        let container_id_for_kill = container_id.clone();
        on_process(ProcessHandle::new(container_name.clone(), move || {
            let docker = docker.clone();
            let container_id = container_id_for_kill.clone();
            Box::pin(async move {
                stop_and_remove(&docker, &container_id).await;
            })
        }));

        let mut parser = OutputParser::new(max_bytes, startup_timeout, idle_timeout);
        let mut stream = attached.output;
        let deadline_check = tokio::time::interval(Duration::from_millis(200));
        tokio::pin!(deadline_check);
        let overall_deadline = tokio::time::sleep(timeout);
        tokio::pin!(overall_deadline);

        let final_output = loop {
            tokio::select! {
                biased;
                _ = &mut overall_deadline => {
                    warn!(container = %container_name, "session exceeded overall timeout");
                    break timeout_output(TimeoutOutcome::ErrorNull);
                }
                _ = deadline_check.tick() => {
                    if let Some(outcome) = parser.check_timeout(tokio::time::Instant::now()) {
                        break timeout_output(outcome);
                    }
                }
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(LogOutput::StdOut { message })) => {
                            for event in parser.feed_stdout(&message) {
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
                        Some(Ok(LogOutput::StdErr { message })) => {
                            parser.feed_stderr(&message);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(source)) => {
                            warn!(container = %container_name, error = %source, "attach stream error");
                            break parser.parse_final_output().unwrap_or_else(|| timeout_output(TimeoutOutcome::ErrorNull));
                        }
                        None => {
                            debug!(container = %container_name, "container stream closed");
                            break parser.parse_final_output().unwrap_or_else(|| timeout_output(TimeoutOutcome::ErrorNull));
                        }
                    }
                }
            }
        };

        parser.output_chain().join().await;
        {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&group.folder);
        }
        stop_and_remove(&self.docker, &container_id).await;

        Ok(final_output)
    }

    async fn send_message(&self, folder: &str, text: &str) -> Result<bool> {
        let sessions = self.sessions.read().await;
        let Some(session) = sessions.get(folder) else {
            return Ok(false);
        };
        let mut stdin = session.stdin.lock().await;
        let mut line = text.as_bytes().to_vec();
        line.push(b'\n');
        stdin.write_all(&line).await.map_err(crate::error::Error::Io)?;
        Ok(true)
    }

    async fn close_stdin(&self, folder: &str, _subdir: Option<&str>) -> Result<()> {
        let sessions = self.sessions.read().await;
        if let Some(session) = sessions.get(folder) {
            let mut stdin = session.stdin.lock().await;
            let _ = stdin.shutdown().await;
        }
        Ok(())
    }

    async fn write_ipc_data(&self, folder: &str, filename: &str, data: &[u8]) -> Result<()> {
        let path = self.ipc_root.join(folder).join(filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_file(&self, folder: &str, relative_path: &str) -> Result<Vec<u8>> {
        let root = self.groups_root.join(folder);
        let path = crate::guard::resolve_path(&root, &root.join(relative_path))?;
        Ok(tokio::fs::read(path).await?)
    }

    async fn write_file(&self, folder: &str, relative_path: &str, data: &[u8]) -> Result<()> {
        let root = self.groups_root.join(folder);
        let path = crate::guard::resolve_path(&root, &root.join(relative_path))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|source| BackendError::InitFailed(source.to_string()))?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            stop_and_remove(&self.docker, &session.container_id).await;
        }
        Ok(())
    }
}

async fn stop_and_remove(docker: &Docker, container_id: &str) {
    let _ = docker
        .stop_container(container_id, Some(StopContainerOptions { t: 10 }))
        .await;
    let _ = docker
        .remove_container(
            container_id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await;
}

fn timeout_output(outcome: TimeoutOutcome) -> crate::parser::AgentOutput {
    use crate::parser::AgentOutputStatus;
    match outcome {
        TimeoutOutcome::SuccessNull => crate::parser::AgentOutput {
            status: AgentOutputStatus::Success,
            result: None,
            new_session_id: None,
            error: None,
        },
        TimeoutOutcome::ErrorNull => crate::parser::AgentOutput {
            status: AgentOutputStatus::Error,
            result: None,
            new_session_id: None,
            error: Some("agent session timed out".to_string()),
        },
    }
}
