//! Ephemeral cloud VM backend: a fresh VM is provisioned per invocation and
//! destroyed afterward; all I/O is mediated through an S3-compatible bucket
//! rather than a direct process or socket attach (the VM has no inbound
//! network path).
//!
//! `aws-sdk-s3`/`aws-config` are not part of the teacher's own dependency
//! stack; they're pulled in because the pack's `solver-ralph` example repo
//! uses the identical object-store polling shape for agent I/O — see
//! `DESIGN.md` for this enrichment-from-the-pack exception. The provisioning
//! calls themselves (`provision_vm`/`destroy_vm`) are behind a small
//! `VmProvisioner` trait so the cloud-specific API call is not baked into
//! this module.

use super::{AgentInput, Backend, OnOutput, OnProcess, ProcessHandle};
use crate::config::SharedRuntimeConfig;
use crate::error::{BackendError, Result};
use crate::parser::{AgentOutput, AgentOutputStatus, OutputParser, TimeoutOutcome};
use crate::RegisteredGroup;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Provisions/destroys the VM itself. Cloud-provider specific; the crate
/// ships no concrete implementation since the provider is a deployment-time
/// choice, matching the teacher's pattern of keeping provider credentials
/// and provisioning calls behind a narrow trait (`messaging::manager`'s
/// registry does the equivalent for chat providers).
#[async_trait]
pub trait VmProvisioner: Send + Sync + 'static {
    async fn provision(&self, folder: &str) -> Result<String>;
    async fn destroy(&self, vm_id: &str) -> Result<()>;
}

struct ActiveVm {
    vm_id: String,
    inbox_prefix: String,
    outbox_prefix: String,
}

pub struct EphemeralVmBackend {
    name: String,
    s3: aws_sdk_s3::Client,
    bucket: String,
    provisioner: Arc<dyn VmProvisioner>,
    runtime_config: SharedRuntimeConfig,
    active: RwLock<std::collections::HashMap<String, ActiveVm>>,
}

impl EphemeralVmBackend {
    pub async fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        provisioner: Arc<dyn VmProvisioner>,
        runtime_config: SharedRuntimeConfig,
    ) -> Self {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            name: name.into(),
            s3: aws_sdk_s3::Client::new(&aws_config),
            bucket: bucket.into(),
            provisioner,
            runtime_config,
            active: RwLock::new(std::collections::HashMap::new()),
        }
    }

    fn workspace_prefix(&self, folder: &str) -> String {
        format!("workspaces/{folder}/")
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.s3
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|source| BackendError::Other(anyhow::anyhow!(source.to_string())))?;
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let resp = self
            .s3
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .send()
            .await
            .map_err(|source| BackendError::Other(anyhow::anyhow!(source.to_string())))?;
        Ok(resp
            .contents()
            .iter()
            .filter_map(|o| o.key().map(str::to_string))
            .collect())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let resp = self
            .s3
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|source| BackendError::Other(anyhow::anyhow!(source.to_string())))?;
        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|source| BackendError::Other(anyhow::anyhow!(source.to_string())))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let _ = self.s3.delete_object().bucket(&self.bucket).key(key).send().await;
        Ok(())
    }
}

#[async_trait]
impl Backend for EphemeralVmBackend {
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

        let vm_id = self.provisioner.provision(&group.folder).await?;
        let inbox_prefix = format!("{}inbox/", self.workspace_prefix(&group.folder));
        let outbox_prefix = format!("{}outbox/", self.workspace_prefix(&group.folder));

        self.put_object(
            &format!("{inbox_prefix}input.json"),
            serde_json::to_vec(&input).map_err(|source| BackendError::Spawn(source.to_string()))?,
        )
        .await?;

        info!(vm_id, folder = %group.folder, "provisioned ephemeral VM session");
        {
            let mut active = self.active.write().await;
            active.insert(
                group.folder.clone(),
                ActiveVm {
                    vm_id: vm_id.clone(),
                    inbox_prefix: inbox_prefix.clone(),
                    outbox_prefix: outbox_prefix.clone(),
                },
            );
        }

        let vm_id_for_kill = vm_id.clone();
        let provisioner = self.provisioner.clone();
        on_process(ProcessHandle::new(vm_id.clone(), move || {
            let vm_id = vm_id_for_kill.clone();
            let provisioner = provisioner.clone();
            Box::pin(async move {
                let _ = provisioner.destroy(&vm_id).await;
            })
        }));

        let mut parser = OutputParser::new(max_bytes, runtime.container_startup_timeout, runtime.idle_timeout);
        let mut seen_keys: HashSet<String> = HashSet::new();
        let mut poll_interval = tokio::time::interval(Duration::from_secs(1));
        let overall_deadline = tokio::time::sleep(timeout);
        tokio::pin!(overall_deadline);

        let final_output = loop {
            tokio::select! {
                biased;
                _ = &mut overall_deadline => {
                    warn!(vm_id, "ephemeral VM session exceeded overall timeout");
                    break timeout_output(TimeoutOutcome::ErrorNull);
                }
                _ = poll_interval.tick() => {
                    if let Some(outcome) = parser.check_timeout(tokio::time::Instant::now()) {
                        break timeout_output(outcome);
                    }

                    let keys = match self.list_objects(&outbox_prefix).await {
                        Ok(keys) => keys,
                        Err(source) => {
                            warn!(vm_id, error = %source, "outbox poll failed");
                            continue;
                        }
                    };
                    let mut terminal: Option<AgentOutput> = None;
                    for key in keys {
                        if !seen_keys.insert(key.clone()) {
                            continue;
                        }
                        let Ok(bytes) = self.get_object(&key).await else { continue };
                        match serde_json::from_slice::<AgentOutput>(&bytes) {
                            Ok(output) => {
                                parser.ingest_output(output.clone());
                                if let Some(cb) = &on_output {
                                    let guard = parser.output_chain().begin();
                                    let cb = cb.clone();
                                    let dispatched = output.clone();
                                    tokio::spawn(async move {
                                        cb(dispatched).await;
                                        drop(guard);
                                    });
                                }
                                // Terminal per spec §4.2.3: an outbox entry with a
                                // non-null result, or status=error, ends the session.
                                if output.result.is_some() || output.status == AgentOutputStatus::Error {
                                    terminal = Some(output);
                                }
                            }
                            Err(source) => {
                                warn!(vm_id, key = %key, error = %source, "malformed outbox entry");
                            }
                        }
                        let _ = self.delete_object(&key).await;
                    }
                    if let Some(output) = terminal {
                        debug!(vm_id, "terminal outbox entry observed");
                        break output;
                    }
                }
            }
        };

        parser.output_chain().join().await;
        {
            let mut active = self.active.write().await;
            active.remove(&group.folder);
        }
        let _ = self.provisioner.destroy(&vm_id).await;

        Ok(final_output)
    }

    async fn send_message(&self, folder: &str, text: &str) -> Result<bool> {
        let Some(inbox_prefix) = self.active.read().await.get(folder).map(|vm| vm.inbox_prefix.clone()) else {
            return Ok(false);
        };
        let key = format!("{inbox_prefix}message-{}.json", uuid::Uuid::new_v4());
        self.put_object(&key, serde_json::json!({ "text": text }).to_string().into_bytes())
            .await?;
        Ok(true)
    }

    async fn close_stdin(&self, folder: &str, _subdir: Option<&str>) -> Result<()> {
        if let Some(inbox_prefix) = self.active.read().await.get(folder).map(|vm| vm.inbox_prefix.clone()) {
            self.put_object(&format!("{inbox_prefix}_close"), Vec::new()).await?;
        }
        Ok(())
    }

    async fn write_ipc_data(&self, folder: &str, filename: &str, data: &[u8]) -> Result<()> {
        let key = format!("{}sync/{filename}", self.workspace_prefix(folder));
        self.put_object(&key, data.to_vec()).await
    }

    async fn read_file(&self, folder: &str, relative_path: &str) -> Result<Vec<u8>> {
        let key = format!("{}{relative_path}", self.workspace_prefix(folder));
        self.get_object(&key).await
    }

    async fn write_file(&self, folder: &str, relative_path: &str, data: &[u8]) -> Result<()> {
        let key = format!("{}{relative_path}", self.workspace_prefix(folder));
        self.put_object(&key, data.to_vec()).await
    }

    async fn initialize(&self) -> Result<()> {
        self.s3
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|source| BackendError::InitFailed(source.to_string()))?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let active = self.active.read().await;
        for vm in active.values() {
            let _ = self.provisioner.destroy(&vm.vm_id).await;
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
