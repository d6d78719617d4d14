// ABOUTME: Cluster scheduler driver speaking the scheduler's REST API
// ABOUTME: Endpoints come back as service DNS names instead of host-mapped ports

use super::{
    ContainerState, Driver, DriverError, LabeledContainer, LaunchSpec, Result, VolumeSpec,
    LABEL_MANAGED,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

/// Configuration for the cluster scheduler driver.
#[derive(Debug, Clone)]
pub struct SchedulerDriverConfig {
    /// Base URL of the scheduler API, e.g. `http://bay-scheduler:7000`.
    pub base_url: String,
    /// Namespace all Bay resources are placed in.
    pub namespace: String,
    pub request_timeout: Duration,
}

impl Default for SchedulerDriverConfig {
    fn default() -> Self {
        Self {
            base_url: "http://bay-scheduler:7000".to_string(),
            namespace: "bay".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Serialize)]
struct CreateVolumeBody<'a> {
    name: &'a str,
    namespace: &'a str,
    labels: &'a HashMap<String, String>,
}

#[derive(Serialize)]
struct CreateNetworkBody<'a> {
    name: &'a str,
    namespace: &'a str,
}

#[derive(Serialize)]
struct CreateContainerBody<'a> {
    name: &'a str,
    namespace: &'a str,
    image: &'a str,
    env: &'a HashMap<String, String>,
    cpus: f64,
    memory_mb: u64,
    port: u16,
    volume: &'a str,
    mount_path: &'a str,
    network: Option<&'a str>,
    labels: HashMap<String, String>,
}

#[derive(Deserialize)]
struct CreatedResource {
    id: String,
}

#[derive(Deserialize)]
struct StartedContainer {
    /// In-cluster service DNS name, e.g. `bay-sess-abc.bay.svc`.
    service_host: String,
    port: u16,
}

#[derive(Deserialize)]
struct ContainerStatusBody {
    phase: String,
}

#[derive(Deserialize)]
struct LogsBody {
    content: String,
}

#[derive(Deserialize)]
struct ListedContainer {
    id: String,
    phase: String,
    #[serde(default)]
    labels: HashMap<String, String>,
}

/// Driver backed by a cluster scheduler's REST API.
///
/// Containers become single-replica workloads; the scheduler exposes each one
/// as an in-cluster service, so endpoints are DNS names rather than IPs.
pub struct SchedulerDriver {
    client: reqwest::Client,
    config: SchedulerDriverConfig,
}

impl SchedulerDriver {
    pub fn new(config: SchedulerDriverConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DriverError::Connection(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn map_transport(e: reqwest::Error, context: &str) -> DriverError {
        if e.is_timeout() || e.is_connect() {
            DriverError::Connection(format!("{context}: {e}"))
        } else {
            DriverError::Backend(format!("{context}: {e}"))
        }
    }

    fn map_status(status: reqwest::StatusCode, context: &str) -> DriverError {
        match status.as_u16() {
            404 => DriverError::NotFound(context.to_string()),
            409 => DriverError::Conflict(context.to_string()),
            500..=599 => DriverError::Unavailable(format!("{context}: {status}")),
            _ => DriverError::Backend(format!("{context}: {status}")),
        }
    }

    async fn delete_ignoring_missing(&self, path: &str, context: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(path))
            .send()
            .await
            .map_err(|e| Self::map_transport(e, context))?;

        if response.status().is_success() || response.status().as_u16() == 404 {
            Ok(())
        } else {
            Err(Self::map_status(response.status(), context))
        }
    }
}

#[async_trait]
impl Driver for SchedulerDriver {
    async fn create_volume(&self, spec: &VolumeSpec) -> Result<String> {
        info!(name = %spec.name, "scheduler.create_volume");

        let mut labels = spec.labels.clone();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());

        let response = self
            .client
            .post(self.url("/v1/volumes"))
            .json(&CreateVolumeBody {
                name: &spec.name,
                namespace: &self.config.namespace,
                labels: &labels,
            })
            .send()
            .await
            .map_err(|e| Self::map_transport(e, "create volume"))?;

        if !response.status().is_success() {
            return Err(Self::map_status(response.status(), "create volume"));
        }

        let created: CreatedResource = response
            .json()
            .await
            .map_err(|e| DriverError::Backend(format!("create volume: {e}")))?;
        Ok(created.id)
    }

    async fn destroy_volume(&self, handle: &str) -> Result<()> {
        info!(handle = %handle, "scheduler.destroy_volume");
        self.delete_ignoring_missing(&format!("/v1/volumes/{handle}"), "destroy volume")
            .await
    }

    async fn create_network(&self, session_id: &str) -> Result<String> {
        let name = format!("bay-net-{session_id}");
        info!(network = %name, "scheduler.create_network");

        let response = self
            .client
            .post(self.url("/v1/networks"))
            .json(&CreateNetworkBody {
                name: &name,
                namespace: &self.config.namespace,
            })
            .send()
            .await
            .map_err(|e| Self::map_transport(e, "create network"))?;

        // Converge re-runs tolerate an existing network.
        if response.status().is_success() || response.status().as_u16() == 409 {
            Ok(name)
        } else {
            Err(Self::map_status(response.status(), "create network"))
        }
    }

    async fn destroy_network(&self, handle: &str) -> Result<()> {
        info!(network = %handle, "scheduler.destroy_network");
        self.delete_ignoring_missing(&format!("/v1/networks/{handle}"), "destroy network")
            .await
    }

    async fn create_container(&self, spec: &LaunchSpec) -> Result<String> {
        info!(name = %spec.name, image = %spec.image, "scheduler.create_container");

        let mut labels = spec.labels.clone();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());

        let response = self
            .client
            .post(self.url("/v1/containers"))
            .json(&CreateContainerBody {
                name: &spec.name,
                namespace: &self.config.namespace,
                image: &spec.image,
                env: &spec.env,
                cpus: spec.cpus,
                memory_mb: spec.memory_mb,
                port: spec.runtime_port,
                volume: &spec.volume.handle,
                mount_path: &spec.volume.mount_path,
                network: spec.network.as_deref(),
                labels,
            })
            .send()
            .await
            .map_err(|e| Self::map_transport(e, "create container"))?;

        if !response.status().is_success() {
            return Err(Self::map_status(response.status(), "create container"));
        }

        let created: CreatedResource = response
            .json()
            .await
            .map_err(|e| DriverError::Backend(format!("create container: {e}")))?;
        Ok(created.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<String> {
        info!(container_id = %container_id, "scheduler.start_container");

        let response = self
            .client
            .post(self.url(&format!("/v1/containers/{container_id}/start")))
            .send()
            .await
            .map_err(|e| Self::map_transport(e, "start container"))?;

        if !response.status().is_success() {
            return Err(Self::map_status(response.status(), "start container"));
        }

        let started: StartedContainer = response
            .json()
            .await
            .map_err(|e| DriverError::Backend(format!("start container: {e}")))?;

        Ok(format!("http://{}:{}", started.service_host, started.port))
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        info!(container_id = %container_id, "scheduler.stop_container");

        let response = self
            .client
            .post(self.url(&format!("/v1/containers/{container_id}/stop")))
            .send()
            .await
            .map_err(|e| Self::map_transport(e, "stop container"))?;

        if response.status().is_success() || response.status().as_u16() == 404 {
            Ok(())
        } else {
            Err(Self::map_status(response.status(), "stop container"))
        }
    }

    async fn destroy_container(&self, container_id: &str) -> Result<()> {
        info!(container_id = %container_id, "scheduler.destroy_container");
        self.delete_ignoring_missing(
            &format!("/v1/containers/{container_id}"),
            "destroy container",
        )
        .await
    }

    async fn status(&self, container_id: &str) -> Result<ContainerState> {
        let response = self
            .client
            .get(self.url(&format!("/v1/containers/{container_id}/status")))
            .send()
            .await
            .map_err(|e| Self::map_transport(e, "container status"))?;

        if response.status().as_u16() == 404 {
            return Ok(ContainerState::NotFound);
        }
        if !response.status().is_success() {
            return Err(Self::map_status(response.status(), "container status"));
        }

        let body: ContainerStatusBody = response
            .json()
            .await
            .map_err(|e| DriverError::Backend(format!("container status: {e}")))?;

        Ok(match body.phase.as_str() {
            "running" => ContainerState::Running,
            "pending" | "succeeded" | "failed" | "terminated" => ContainerState::Exited,
            other => {
                warn!(phase = %other, "scheduler reported unknown phase");
                ContainerState::Unknown
            }
        })
    }

    async fn logs(&self, container_id: &str, tail: usize) -> Result<String> {
        let response = self
            .client
            .get(self.url(&format!(
                "/v1/containers/{container_id}/logs?tail={tail}"
            )))
            .send()
            .await
            .map_err(|e| Self::map_transport(e, "container logs"))?;

        if response.status().as_u16() == 404 {
            return Ok(String::new());
        }
        if !response.status().is_success() {
            return Err(Self::map_status(response.status(), "container logs"));
        }

        let body: LogsBody = response
            .json()
            .await
            .map_err(|e| DriverError::Backend(format!("container logs: {e}")))?;
        Ok(body.content)
    }

    async fn list_labeled(&self, label: &str, value: &str) -> Result<Vec<LabeledContainer>> {
        let response = self
            .client
            .get(self.url(&format!(
                "/v1/containers?namespace={}&label={label}={value}",
                self.config.namespace
            )))
            .send()
            .await
            .map_err(|e| Self::map_transport(e, "list containers"))?;

        if !response.status().is_success() {
            return Err(Self::map_status(response.status(), "list containers"));
        }

        let listed: Vec<ListedContainer> = response
            .json()
            .await
            .map_err(|e| DriverError::Backend(format!("list containers: {e}")))?;

        Ok(listed
            .into_iter()
            .map(|c| LabeledContainer {
                container_id: c.id,
                state: match c.phase.as_str() {
                    "running" => ContainerState::Running,
                    _ => ContainerState::Exited,
                },
                labels: c.labels,
            })
            .collect())
    }
}
