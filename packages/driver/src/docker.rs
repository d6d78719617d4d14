// ABOUTME: Docker driver implementation over the bollard client
// ABOUTME: Realizes containers, volumes and session networks on a single host daemon

use super::{
    ContainerState, CreatedContainer, Driver, DriverError, LabeledContainer, LaunchSpec, Result,
    VolumeSpec, LABEL_MANAGED, LABEL_RUNTIME_PORT, LABEL_SESSION_ID,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::network::CreateNetworkOptions;
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Grace period for container stop before the daemon kills it.
const STOP_TIMEOUT_SECS: i64 = 10;

/// Configuration for the single-host docker driver.
#[derive(Debug, Clone)]
pub struct DockerDriverConfig {
    /// Network containers join when no session network is requested.
    pub default_network: String,
}

impl Default for DockerDriverConfig {
    fn default() -> Self {
        Self {
            default_network: "bay-network".to_string(),
        }
    }
}

pub struct DockerDriver {
    client: Docker,
    config: DockerDriverConfig,
}

impl DockerDriver {
    pub fn new(config: DockerDriverConfig) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| DriverError::Connection(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn with_client(client: Docker, config: DockerDriverConfig) -> Self {
        Self { client, config }
    }

    fn map_error(e: bollard::errors::Error, context: &str) -> DriverError {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => match status_code {
                404 => DriverError::NotFound(format!("{context}: {message}")),
                409 => DriverError::Conflict(format!("{context}: {message}")),
                500..=599 => DriverError::Unavailable(format!("{context}: {message}")),
                _ => DriverError::Backend(format!("{context}: {message}")),
            },
            other => DriverError::Connection(format!("{context}: {other}")),
        }
    }

    fn is_not_found(e: &bollard::errors::Error) -> bool {
        matches!(
            e,
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }
        )
    }

    /// Derive the runtime endpoint from an inspected container: the IP on the
    /// attached network plus the runtime port recorded in the labels.
    fn endpoint_from_inspect(
        &self,
        inspect: &bollard::models::ContainerInspectResponse,
    ) -> Result<String> {
        let labels = inspect
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();

        let port: u16 = labels
            .get(LABEL_RUNTIME_PORT)
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| {
                DriverError::Backend("container is missing the runtime port label".to_string())
            })?;

        let networks = inspect
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.clone())
            .unwrap_or_default();

        // Prefer the default network; otherwise take any attached network with an IP.
        let ip = networks
            .get(&self.config.default_network)
            .and_then(|n| n.ip_address.clone())
            .filter(|ip| !ip.is_empty())
            .or_else(|| {
                networks
                    .values()
                    .find_map(|n| n.ip_address.clone().filter(|ip| !ip.is_empty()))
            });

        if let Some(ip) = ip {
            return Ok(format!("http://{ip}:{port}"));
        }

        // Fallback: intra-network DNS by container name.
        let name = inspect
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/').to_string())
            .ok_or_else(|| DriverError::Backend("container has no name".to_string()))?;
        Ok(format!("http://{name}:{port}"))
    }
}

#[async_trait]
impl Driver for DockerDriver {
    async fn create_volume(&self, spec: &VolumeSpec) -> Result<String> {
        info!(name = %spec.name, "docker.create_volume");

        let mut labels = spec.labels.clone();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());

        let volume = self
            .client
            .create_volume(CreateVolumeOptions {
                name: spec.name.clone(),
                labels,
                ..Default::default()
            })
            .await
            .map_err(|e| Self::map_error(e, "create volume"))?;

        Ok(volume.name)
    }

    async fn destroy_volume(&self, handle: &str) -> Result<()> {
        info!(handle = %handle, "docker.destroy_volume");

        match self.client.remove_volume(handle, None).await {
            Ok(()) => Ok(()),
            Err(e) if Self::is_not_found(&e) => {
                warn!(handle = %handle, "volume already gone");
                Ok(())
            }
            Err(e) => Err(Self::map_error(e, "destroy volume")),
        }
    }

    async fn create_network(&self, session_id: &str) -> Result<String> {
        let name = format!("bay-net-{session_id}");
        info!(network = %name, "docker.create_network");

        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_SESSION_ID.to_string(), session_id.to_string());

        match self
            .client
            .create_network(CreateNetworkOptions {
                name: name.clone(),
                labels,
                ..Default::default()
            })
            .await
        {
            Ok(_) => Ok(name),
            // Re-running converge may find the network already present.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(name),
            Err(e) => Err(Self::map_error(e, "create network")),
        }
    }

    async fn destroy_network(&self, handle: &str) -> Result<()> {
        info!(network = %handle, "docker.destroy_network");

        match self.client.remove_network(handle).await {
            Ok(()) => Ok(()),
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(Self::map_error(e, "destroy network")),
        }
    }

    async fn create_container(&self, spec: &LaunchSpec) -> Result<String> {
        info!(name = %spec.name, image = %spec.image, "docker.create_container");

        let mut labels = spec.labels.clone();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_RUNTIME_PORT.to_string(), spec.runtime_port.to_string());

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let network_mode = spec
            .network
            .clone()
            .unwrap_or_else(|| self.config.default_network.clone());

        let host_config = bollard::models::HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                spec.volume.handle, spec.volume.mount_path
            )]),
            memory: Some((spec.memory_mb * 1024 * 1024) as i64),
            nano_cpus: Some((spec.cpus * 1e9) as i64),
            network_mode: Some(network_mode),
            pids_limit: Some(256),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| Self::map_error(e, "create container"))?;

        debug!(container_id = %container.id, "docker.created");
        Ok(container.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<String> {
        info!(container_id = %container_id, "docker.start_container");

        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Self::map_error(e, "start container"))?;

        let inspect = self
            .client
            .inspect_container(container_id, None)
            .await
            .map_err(|e| Self::map_error(e, "inspect container"))?;

        let endpoint = self.endpoint_from_inspect(&inspect)?;
        info!(container_id = %container_id, endpoint = %endpoint, "docker.started");
        Ok(endpoint)
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        info!(container_id = %container_id, "docker.stop_container");

        let options = StopContainerOptions { t: STOP_TIMEOUT_SECS };
        match self.client.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(Self::map_error(e, "stop container")),
        }
    }

    async fn destroy_container(&self, container_id: &str) -> Result<()> {
        info!(container_id = %container_id, "docker.destroy_container");

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(Self::map_error(e, "destroy container")),
        }
    }

    async fn status(&self, container_id: &str) -> Result<ContainerState> {
        let inspect = match self.client.inspect_container(container_id, None).await {
            Ok(i) => i,
            Err(e) if Self::is_not_found(&e) => return Ok(ContainerState::NotFound),
            Err(e) => return Err(Self::map_error(e, "inspect container")),
        };

        use bollard::models::ContainerStateStatusEnum as Status;
        let status = inspect.state.as_ref().and_then(|s| s.status);

        Ok(match status {
            Some(Status::RUNNING) | Some(Status::RESTARTING) => ContainerState::Running,
            Some(Status::CREATED)
            | Some(Status::PAUSED)
            | Some(Status::EXITED)
            | Some(Status::DEAD)
            | Some(Status::REMOVING) => ContainerState::Exited,
            Some(Status::EMPTY) | None => ContainerState::Unknown,
        })
    }

    async fn logs(&self, container_id: &str, tail: usize) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.logs(container_id, Some(options));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => out.push_str(&log.to_string()),
                Err(e) if Self::is_not_found(&e) => return Ok(out),
                Err(e) => return Err(Self::map_error(e, "container logs")),
            }
        }
        Ok(out)
    }

    async fn list_labeled(&self, label: &str, value: &str) -> Result<Vec<LabeledContainer>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{label}={value}")],
        );

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| Self::map_error(e, "list containers"))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let container_id = c.id?;
                let state = match c.state.as_deref() {
                    Some("running") | Some("restarting") => ContainerState::Running,
                    Some(_) => ContainerState::Exited,
                    None => ContainerState::Unknown,
                };
                Some(LabeledContainer {
                    container_id,
                    labels: c.labels.unwrap_or_default(),
                    state,
                })
            })
            .collect())
    }

    async fn create_multi(&self, specs: &[LaunchSpec]) -> Result<Vec<CreatedContainer>> {
        // The daemon has no native batch create; fall back to the rollback loop.
        let mut created: Vec<CreatedContainer> = Vec::with_capacity(specs.len());
        for spec in specs {
            match self.create_container(spec).await {
                Ok(container_id) => created.push(CreatedContainer {
                    name: spec.name.clone(),
                    container_id,
                }),
                Err(e) => {
                    for c in &created {
                        if let Err(cleanup_err) = self.destroy_container(&c.container_id).await {
                            warn!(
                                container_id = %c.container_id,
                                error = %cleanup_err,
                                "rollback destroy failed during batch create"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(created)
    }
}
