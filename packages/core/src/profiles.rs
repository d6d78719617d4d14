// ABOUTME: Profile registry - immutable container composition templates
// ABOUTME: Loaded from the embedded profiles.json at startup

use crate::error::{CoreError, Result};
use bay_runtime::RuntimeKind;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A named operation family a runtime provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Python,
    Shell,
    Filesystem,
    Browser,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Shell => "shell",
            Self::Filesystem => "filesystem",
            Self::Browser => "browser",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerRole {
    Primary,
    Sidecar,
}

impl ContainerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Sidecar => "sidecar",
        }
    }
}

/// One container of a profile's composition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileContainer {
    pub name: String,
    pub image: String,
    pub role: ContainerRole,
    pub runtime: RuntimeKind,
    pub runtime_port: u16,
    #[serde(default)]
    pub cpus: f64,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub capabilities: Vec<Capability>,
}

/// Immutable configuration template for a sandbox's compute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub idle_timeout_seconds: i64,
    pub containers: Vec<ProfileContainer>,
    /// Explicit capability -> container-name overrides. Capabilities not
    /// listed fall back to the first container declaring them.
    #[serde(default)]
    pub primary_for: HashMap<Capability, String>,
}

impl Profile {
    pub fn primary_container(&self) -> &ProfileContainer {
        self.containers
            .iter()
            .find(|c| c.role == ContainerRole::Primary)
            .unwrap_or(&self.containers[0])
    }

    pub fn declared_capabilities(&self) -> HashSet<Capability> {
        self.containers
            .iter()
            .flat_map(|c| c.capabilities.iter().copied())
            .collect()
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.containers
            .iter()
            .any(|c| c.capabilities.contains(&capability))
    }

    /// Which container serves a capability: the primary-for map wins, then
    /// the first container declaring it.
    pub fn container_for(&self, capability: Capability) -> Option<&ProfileContainer> {
        if let Some(name) = self.primary_for.get(&capability) {
            if let Some(container) = self.containers.iter().find(|c| &c.name == name) {
                return Some(container);
            }
        }
        self.containers
            .iter()
            .find(|c| c.capabilities.contains(&capability))
    }

    pub fn is_multi_container(&self) -> bool {
        self.containers.len() > 1
    }

    fn validate(&self) -> Result<()> {
        if self.containers.is_empty() {
            return Err(CoreError::Validation(format!(
                "profile {} has no containers",
                self.id
            )));
        }
        let mut names = HashSet::new();
        for container in &self.containers {
            if !names.insert(&container.name) {
                return Err(CoreError::Validation(format!(
                    "profile {} has duplicate container name {}",
                    self.id, container.name
                )));
            }
        }
        for (capability, name) in &self.primary_for {
            let Some(container) = self.containers.iter().find(|c| &c.name == name) else {
                return Err(CoreError::Validation(format!(
                    "profile {} routes {} to unknown container {name}",
                    self.id,
                    capability.as_str()
                )));
            };
            if !container.capabilities.contains(capability) {
                return Err(CoreError::Validation(format!(
                    "profile {} routes {} to container {name} which does not declare it",
                    self.id,
                    capability.as_str()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ProfilesConfig {
    #[allow(dead_code)]
    version: String,
    profiles: Vec<Profile>,
}

/// Registry of the profiles this instance offers.
pub struct ProfileRegistry {
    profiles: HashMap<String, Profile>,
}

impl ProfileRegistry {
    /// Load the embedded profile set.
    pub fn new() -> Result<Self> {
        Self::from_json(include_str!("../config/profiles.json"))
    }

    pub fn from_json(config_json: &str) -> Result<Self> {
        let config: ProfilesConfig = serde_json::from_str(config_json)
            .map_err(|e| CoreError::Validation(format!("profiles config: {e}")))?;

        let mut profiles = HashMap::new();
        for profile in config.profiles {
            profile.validate()?;
            profiles.insert(profile.id.clone(), profile);
        }
        Ok(Self { profiles })
    }

    pub fn get(&self, id: &str) -> Option<&Profile> {
        self.profiles.get(id)
    }

    pub fn list(&self) -> Vec<&Profile> {
        let mut profiles: Vec<&Profile> = self.profiles.values().collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        profiles
    }

    pub fn exists(&self, id: &str) -> bool {
        self.profiles.contains_key(id)
    }
}
