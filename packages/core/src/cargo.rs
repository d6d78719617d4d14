// ABOUTME: CargoManager - lifecycle and reference counting for persistent volumes
// ABOUTME: Managed cargos are deleted only through their owning sandbox's cascade

use crate::error::{CoreError, Result};
use crate::ids::new_id;
use bay_driver::{Driver, VolumeSpec, LABEL_OWNER};
use bay_runtime::WORKSPACE_MOUNT_PATH;
use bay_storage::{Cargo, CargoKind, CargoStore, SandboxStore};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct CargoManager {
    driver: Arc<dyn Driver>,
    cargos: CargoStore,
    sandboxes: SandboxStore,
}

impl CargoManager {
    pub fn new(driver: Arc<dyn Driver>, cargos: CargoStore, sandboxes: SandboxStore) -> Self {
        Self {
            driver,
            cargos,
            sandboxes,
        }
    }

    /// Create a cargo and its backing volume. `managed_by_sandbox_id` is set
    /// iff the cargo is managed.
    pub async fn create(
        &self,
        owner: &str,
        kind: CargoKind,
        managed_by_sandbox_id: Option<String>,
    ) -> Result<Cargo> {
        if (kind == CargoKind::Managed) != managed_by_sandbox_id.is_some() {
            return Err(CoreError::Internal(
                "managed cargo requires exactly one owning sandbox".to_string(),
            ));
        }

        let id = new_id("cargo");
        let handle_name = format!("bay-{id}");
        info!(cargo_id = %id, owner = %owner, kind = %kind.as_str(), "cargo.create");

        let mut labels = HashMap::new();
        labels.insert(LABEL_OWNER.to_string(), owner.to_string());
        labels.insert("bay.cargo-id".to_string(), id.clone());

        let backend_handle = self
            .driver
            .create_volume(&VolumeSpec {
                name: handle_name,
                labels,
            })
            .await?;

        let now = Utc::now();
        let cargo = Cargo {
            id,
            owner: owner.to_string(),
            backend_handle,
            kind,
            mount_path: WORKSPACE_MOUNT_PATH.to_string(),
            managed_by_sandbox_id,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 0,
        };

        if let Err(e) = self.cargos.create(&cargo).await {
            // Record insert failed; do not leave the volume behind.
            if let Err(cleanup) = self.driver.destroy_volume(&cargo.backend_handle).await {
                warn!(
                    cargo_id = %cargo.id,
                    error = %cleanup,
                    "failed to roll back volume after record insert failure"
                );
            }
            return Err(e.into());
        }

        Ok(cargo)
    }

    pub async fn get(&self, id: &str, owner: &str) -> Result<Cargo> {
        self.cargos
            .get(id, owner)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Cargo not found: {id}")))
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Cargo> {
        self.cargos
            .get_by_id(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Cargo not found: {id}")))
    }

    pub async fn list(
        &self,
        owner: &str,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<Vec<Cargo>> {
        Ok(self.cargos.list(owner, limit, cursor).await?)
    }

    /// Delete a cargo: destroy the backend volume, then soft-delete the row.
    ///
    /// Direct deletion of a managed cargo is refused; the sandbox cascade
    /// passes `force`. External cargos are refused while live sandboxes still
    /// reference them.
    pub async fn delete(&self, id: &str, owner: &str, force: bool) -> Result<()> {
        let cargo = self.get(id, owner).await?;

        if cargo.kind == CargoKind::Managed && !force {
            return Err(CoreError::Conflict(format!(
                "cargo {id} is managed by sandbox {}; delete the sandbox instead",
                cargo.managed_by_sandbox_id.as_deref().unwrap_or("unknown")
            )));
        }

        if cargo.kind == CargoKind::External {
            let refs = self.sandboxes.active_references(id).await?;
            if !refs.is_empty() {
                return Err(CoreError::Conflict(format!(
                    "cargo {id} is referenced by sandboxes: {}",
                    refs.join(", ")
                )));
            }
        }

        info!(cargo_id = %id, owner = %owner, "cargo.delete");
        self.driver.destroy_volume(&cargo.backend_handle).await?;
        self.cargos.mark_deleted(id).await?;
        Ok(())
    }
}
