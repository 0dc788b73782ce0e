use crate::error::{ActuatorError, ActuatorResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub mod docker;
pub mod job;
pub mod objectstore;
pub mod storage;

/// Effect on the compute half of a workspace. Implementations must be
/// idempotent: calling twice with the same arguments lands in the same
/// post-state as calling once.
#[async_trait]
pub trait InstanceController: Send + Sync {
    /// Bring the workspace container up. Returns only once `is_running`
    /// would be true. An existing-but-dead container is removed and
    /// recreated.
    async fn start(&self, workspace_id: Uuid, image_ref: &str) -> ActuatorResult<()>;

    /// Immediate kill and remove; no graceful drain — user data lives on
    /// the volume, not in the container. Succeeds if none exists.
    async fn delete(&self, workspace_id: Uuid) -> ActuatorResult<()>;

    /// Semantic probe: would a proxy request succeed right now? Not merely
    /// "process present".
    async fn is_running(&self, workspace_id: Uuid) -> ActuatorResult<bool>;
}

/// Effect on the storage half: home volume plus object-store archives.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Create an empty home volume; no-op if present.
    async fn provision(&self, workspace_id: Uuid) -> ActuatorResult<()>;

    /// Populate the volume from the named archive. On success returns the
    /// restore marker (equal to `archive_key`).
    async fn restore(&self, workspace_id: Uuid, archive_key: &str) -> ActuatorResult<String>;

    /// Archive the volume under the op-id path; returns the archive key.
    async fn archive(&self, workspace_id: Uuid, op_id: Uuid) -> ActuatorResult<String>;

    /// Remove the home volume; succeeds if already gone.
    async fn delete_volume(&self, workspace_id: Uuid) -> ActuatorResult<()>;

    async fn volume_exists(&self, workspace_id: Uuid) -> ActuatorResult<bool>;

    /// Probe the archive blob and its integrity sidecar. Returns the
    /// condition status plus the reason to record.
    async fn archive_accessible(&self, archive_key: &str) -> ActuatorResult<(bool, String)>;

    /// Drop the blob and sidecar for a released archive. Used by the
    /// ARCHIVED -> PENDING step and by deletion cleanup; idempotent.
    async fn delete_archive(&self, archive_key: &str) -> ActuatorResult<()>;
}

/// Backend registry, populated at startup from configuration. Workspaces
/// pick their implementations by name through the `instance_backend` /
/// `storage_backend` columns.
pub struct Actuators {
    instances: HashMap<String, Arc<dyn InstanceController>>,
    storages: HashMap<String, Arc<dyn StorageProvider>>,
}

impl Actuators {
    pub fn new() -> Self {
        Self {
            instances: HashMap::new(),
            storages: HashMap::new(),
        }
    }

    pub fn register_instance(&mut self, name: &str, backend: Arc<dyn InstanceController>) {
        self.instances.insert(name.to_string(), backend);
    }

    pub fn register_storage(&mut self, name: &str, backend: Arc<dyn StorageProvider>) {
        self.storages.insert(name.to_string(), backend);
    }

    pub fn instance(&self, backend: &str) -> ActuatorResult<Arc<dyn InstanceController>> {
        self.instances.get(backend).cloned().ok_or_else(|| {
            ActuatorError::non_retryable(
                codehub_types::ErrorReason::Mismatch,
                format!("unknown instance backend: {backend}"),
            )
        })
    }

    pub fn storage(&self, backend: &str) -> ActuatorResult<Arc<dyn StorageProvider>> {
        self.storages.get(backend).cloned().ok_or_else(|| {
            ActuatorError::non_retryable(
                codehub_types::ErrorReason::Mismatch,
                format!("unknown storage backend: {backend}"),
            )
        })
    }
}

impl Default for Actuators {
    fn default() -> Self {
        Self::new()
    }
}
