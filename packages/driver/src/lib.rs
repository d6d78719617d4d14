// ABOUTME: Driver trait and implementations for container backend access
// ABOUTME: Defines the narrow interface Bay uses for container/volume/network lifecycle

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub mod docker;
pub mod scheduler;

pub use docker::DockerDriver;
pub use scheduler::SchedulerDriver;

/// Label keys stamped on every backend resource Bay creates.
pub const LABEL_MANAGED: &str = "bay.managed";
pub const LABEL_OWNER: &str = "bay.owner";
pub const LABEL_SANDBOX_ID: &str = "bay.sandbox-id";
pub const LABEL_SESSION_ID: &str = "bay.session-id";
pub const LABEL_ROLE: &str = "bay.role";
pub const LABEL_RUNTIME_PORT: &str = "bay.runtime-port";

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Backend connection error: {0}")]
    Connection(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Backend conflict: {0}")]
    Conflict(String),

    #[error("Backend temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl DriverError {
    /// Whether the caller may retry the same operation.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// Cheap container status probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited,
    NotFound,
    Unknown,
}

/// Specification for a persistent data volume.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    pub name: String,
    pub labels: HashMap<String, String>,
}

/// Volume attachment for a container.
#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub handle: String,
    pub mount_path: String,
}

/// Everything the backend needs to allocate one container.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub cpus: f64,
    pub memory_mb: u64,
    /// Port the runtime listens on inside the container.
    pub runtime_port: u16,
    pub volume: VolumeMount,
    /// Session network to attach to, if any.
    pub network: Option<String>,
    pub labels: HashMap<String, String>,
}

/// Result of allocating one container out of a multi-create batch.
#[derive(Debug, Clone)]
pub struct CreatedContainer {
    pub name: String,
    pub container_id: String,
}

/// A backend container matched by a label query.
#[derive(Debug, Clone)]
pub struct LabeledContainer {
    pub container_id: String,
    pub labels: HashMap<String, String>,
    pub state: ContainerState,
}

/// Abstraction over the container backend.
///
/// The driver is the only component that talks to the backend. It does not
/// retry, audit, or authorize; callers own those policies. Destroy and stop
/// operations treat missing resources as success.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Create a persistent volume, returning the backend handle.
    async fn create_volume(&self, spec: &VolumeSpec) -> Result<String>;

    /// Delete a volume. Missing volumes are not an error.
    async fn destroy_volume(&self, handle: &str) -> Result<()>;

    /// Create (or reuse) a session-scoped network.
    async fn create_network(&self, session_id: &str) -> Result<String>;

    /// Remove a session network. Missing networks are not an error.
    async fn destroy_network(&self, handle: &str) -> Result<()>;

    /// Allocate a container without starting it.
    async fn create_container(&self, spec: &LaunchSpec) -> Result<String>;

    /// Start a container and return the endpoint its runtime is reachable on.
    async fn start_container(&self, container_id: &str) -> Result<String>;

    /// Gracefully stop a container. Missing containers are not an error.
    async fn stop_container(&self, container_id: &str) -> Result<()>;

    /// Forcefully remove a container. Missing containers are not an error.
    async fn destroy_container(&self, container_id: &str) -> Result<()>;

    /// Cheap status probe.
    async fn status(&self, container_id: &str) -> Result<ContainerState>;

    /// Recent container logs, for diagnostics surfacing.
    async fn logs(&self, container_id: &str, tail: usize) -> Result<String>;

    /// List backend containers carrying the given label value.
    async fn list_labeled(&self, label: &str, value: &str) -> Result<Vec<LabeledContainer>>;

    /// Allocate a batch of containers atomically: if any allocation fails,
    /// every container already created by this call is destroyed before the
    /// error propagates.
    async fn create_multi(&self, specs: &[LaunchSpec]) -> Result<Vec<CreatedContainer>> {
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
                            tracing::warn!(
                                container_id = %c.container_id,
                                error = %cleanup_err,
                                "failed to roll back container after batch create failure"
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Driver that fails the Nth create and records destroys.
    struct FlakyDriver {
        creates: AtomicUsize,
        fail_at: usize,
        destroyed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Driver for FlakyDriver {
        async fn create_volume(&self, spec: &VolumeSpec) -> Result<String> {
            Ok(spec.name.clone())
        }
        async fn destroy_volume(&self, _handle: &str) -> Result<()> {
            Ok(())
        }
        async fn create_network(&self, session_id: &str) -> Result<String> {
            Ok(format!("net-{session_id}"))
        }
        async fn destroy_network(&self, _handle: &str) -> Result<()> {
            Ok(())
        }
        async fn create_container(&self, spec: &LaunchSpec) -> Result<String> {
            let n = self.creates.fetch_add(1, Ordering::SeqCst);
            if n + 1 == self.fail_at {
                return Err(DriverError::Backend("boom".into()));
            }
            Ok(format!("ctr-{}", spec.name))
        }
        async fn start_container(&self, _container_id: &str) -> Result<String> {
            Ok("http://10.0.0.2:8000".into())
        }
        async fn stop_container(&self, _container_id: &str) -> Result<()> {
            Ok(())
        }
        async fn destroy_container(&self, container_id: &str) -> Result<()> {
            self.destroyed.lock().unwrap().push(container_id.to_string());
            Ok(())
        }
        async fn status(&self, _container_id: &str) -> Result<ContainerState> {
            Ok(ContainerState::Running)
        }
        async fn logs(&self, _container_id: &str, _tail: usize) -> Result<String> {
            Ok(String::new())
        }
        async fn list_labeled(&self, _label: &str, _value: &str) -> Result<Vec<LabeledContainer>> {
            Ok(vec![])
        }
    }

    fn spec(name: &str) -> LaunchSpec {
        LaunchSpec {
            name: name.to_string(),
            image: "ship:latest".to_string(),
            env: HashMap::new(),
            cpus: 1.0,
            memory_mb: 1024,
            runtime_port: 8000,
            volume: VolumeMount {
                handle: "vol".to_string(),
                mount_path: "/workspace".to_string(),
            },
            network: None,
            labels: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_multi_rolls_back_on_failure() {
        let driver = FlakyDriver {
            creates: AtomicUsize::new(0),
            fail_at: 3,
            destroyed: Mutex::new(Vec::new()),
        };

        let specs = vec![spec("main"), spec("browser"), spec("extra")];
        let result = driver.create_multi(&specs).await;
        assert!(result.is_err());

        let destroyed = driver.destroyed.lock().unwrap();
        assert_eq!(destroyed.as_slice(), &["ctr-main", "ctr-browser"]);
    }

    #[tokio::test]
    async fn test_create_multi_success_preserves_order() {
        let driver = FlakyDriver {
            creates: AtomicUsize::new(0),
            fail_at: 0,
            destroyed: Mutex::new(Vec::new()),
        };

        let specs = vec![spec("main"), spec("browser")];
        let created = driver.create_multi(&specs).await.unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].name, "main");
        assert_eq!(created[1].name, "browser");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(DriverError::Connection("x".into()).retryable());
        assert!(DriverError::Unavailable("x".into()).retryable());
        assert!(!DriverError::NotFound("x".into()).retryable());
        assert!(!DriverError::Backend("x".into()).retryable());
    }
}
