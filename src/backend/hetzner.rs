//! Hetzner Cloud `VmProvisioner`: creates one server per agent invocation via
//! the Hetzner Cloud API (`POST /servers`), polls `status` until `running`,
//! and deletes the server on `destroy`. Grounded on `backend::sandbox`'s
//! reqwest-client-plus-bearer-token shape; the poll-until-running loop
//! mirrors that module's `ensure_provisioned` polling pattern applied to a
//! VM's `status` field instead of a sandbox-ready flag.

use super::vm::VmProvisioner;
use crate::error::{BackendError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

const API_BASE: &str = "https://api.hetzner.cloud/v1";

pub struct HetznerProvisioner {
    client: reqwest::Client,
    token: String,
    server_type: String,
    image: String,
    location: Option<String>,
    ssh_keys: Vec<String>,
    user_data: Option<String>,
}

impl HetznerProvisioner {
    pub fn new(
        token: impl Into<String>,
        server_type: impl Into<String>,
        image: impl Into<String>,
        location: Option<String>,
        ssh_keys: Vec<String>,
        user_data: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.into(),
            server_type: server_type.into(),
            image: image.into(),
            location,
            ssh_keys,
            user_data,
        }
    }

    fn bearer(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.token)
    }
}

#[derive(Deserialize)]
struct CreateServerResponse {
    server: ServerRef,
}

#[derive(Deserialize)]
struct ServerRef {
    id: u64,
}

#[derive(Deserialize)]
struct ServerStatusResponse {
    server: ServerStatus,
}

#[derive(Deserialize)]
struct ServerStatus {
    status: String,
}

#[async_trait]
impl VmProvisioner for HetznerProvisioner {
    async fn provision(&self, folder: &str) -> Result<String> {
        let body = serde_json::json!({
            "name": format!("nanoclaw-{folder}-{}", chrono::Utc::now().timestamp_millis()),
            "server_type": self.server_type,
            "image": self.image,
            "location": self.location,
            "ssh_keys": self.ssh_keys,
            "user_data": self.user_data,
        });
        let resp = self
            .bearer(self.client.post(format!("{API_BASE}/servers")))
            .json(&body)
            .send()
            .await
            .map_err(|source| BackendError::Spawn(source.to_string()))?;
        if !resp.status().is_success() {
            return Err(BackendError::Spawn(format!(
                "hetzner server create failed: {}",
                resp.status()
            ))
            .into());
        }
        let created: CreateServerResponse = resp
            .json()
            .await
            .map_err(|source| BackendError::Spawn(source.to_string()))?;
        let vm_id = created.server.id.to_string();
        info!(vm_id, folder, "hetzner server created, waiting for running state");

        let mut waited = Duration::ZERO;
        let poll = Duration::from_secs(2);
        let deadline = Duration::from_secs(120);
        loop {
            let status = self.poll_status(&vm_id).await?;
            if status == "running" {
                break;
            }
            if waited >= deadline {
                return Err(BackendError::Spawn(format!(
                    "hetzner server {vm_id} did not reach running state within {deadline:?}"
                ))
                .into());
            }
            tokio::time::sleep(poll).await;
            waited += poll;
        }
        Ok(vm_id)
    }

    async fn destroy(&self, vm_id: &str) -> Result<()> {
        debug!(vm_id, "destroying hetzner server");
        let _ = self
            .bearer(self.client.delete(format!("{API_BASE}/servers/{vm_id}")))
            .send()
            .await;
        Ok(())
    }
}

impl HetznerProvisioner {
    async fn poll_status(&self, vm_id: &str) -> Result<String> {
        let resp = self
            .bearer(self.client.get(format!("{API_BASE}/servers/{vm_id}")))
            .send()
            .await
            .map_err(|source| BackendError::Spawn(source.to_string()))?;
        let status: ServerStatusResponse = resp
            .json()
            .await
            .map_err(|source| BackendError::Spawn(source.to_string()))?;
        Ok(status.server.status)
    }
}

/// Railway's service-create API is GraphQL; this provisioner hits the same
/// `VmProvisioner` contract but through Railway's `POST /graphql/v2`
/// endpoint instead of a REST resource, reusing the same bearer-token client
/// shape as [`HetznerProvisioner`].
pub struct RailwayProvisioner {
    client: reqwest::Client,
    token: String,
    project_id: String,
    environment_id: String,
    image: String,
}

impl RailwayProvisioner {
    pub fn new(
        token: impl Into<String>,
        project_id: impl Into<String>,
        environment_id: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.into(),
            project_id: project_id.into(),
            environment_id: environment_id.into(),
            image: image.into(),
        }
    }

    async fn graphql(&self, query: &str, variables: serde_json::Value) -> Result<serde_json::Value> {
        let resp = self
            .client
            .post("https://backboard.railway.app/graphql/v2")
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|source| BackendError::Spawn(source.to_string()))?;
        resp.json::<serde_json::Value>()
            .await
            .map_err(|source| BackendError::Spawn(source.to_string()).into())
    }
}

#[async_trait]
impl VmProvisioner for RailwayProvisioner {
    async fn provision(&self, folder: &str) -> Result<String> {
        let query = r#"
            mutation ServiceCreate($input: ServiceCreateInput!) {
                serviceCreate(input: $input) { id }
            }
        "#;
        let variables = serde_json::json!({
            "input": {
                "projectId": self.project_id,
                "environmentId": self.environment_id,
                "name": format!("nanoclaw-{folder}"),
                "source": { "image": self.image },
            }
        });
        let response = self.graphql(query, variables).await?;
        let service_id = response
            .get("data")
            .and_then(|d| d.get("serviceCreate"))
            .and_then(|s| s.get("id"))
            .and_then(|id| id.as_str())
            .ok_or_else(|| BackendError::Spawn(format!("railway serviceCreate returned no id: {response}")))?
            .to_string();
        info!(service_id, folder, "railway service created");
        Ok(service_id)
    }

    async fn destroy(&self, vm_id: &str) -> Result<()> {
        let query = r#"
            mutation ServiceDelete($id: String!) {
                serviceDelete(id: $id)
            }
        "#;
        let _ = self.graphql(query, serde_json::json!({ "id": vm_id })).await;
        Ok(())
    }
}
