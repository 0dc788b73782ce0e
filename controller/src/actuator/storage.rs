use crate::actuator::StorageProvider;
use crate::actuator::docker::DockerVolumes;
use crate::actuator::job::{JobEnv, JobMode, JobRunner, JobSpec};
use crate::actuator::objectstore::ObjectStore;
use crate::error::ActuatorResult;
use async_trait::async_trait;
use bollard::Docker;
use codehub_types::archive_key;
use uuid::Uuid;

/// Storage provider composed of docker volumes for the home directory,
/// worker job containers for the heavy data movement, and S3 for the
/// archive objects themselves.
pub struct DockerStorageProvider {
    volumes: DockerVolumes,
    jobs: JobRunner,
    store: ObjectStore,
}

impl DockerStorageProvider {
    pub fn new(docker: Docker, store: ObjectStore, job_env: JobEnv) -> Self {
        Self {
            volumes: DockerVolumes::new(docker.clone()),
            jobs: JobRunner::new(docker, job_env),
            store,
        }
    }

    fn archive_url(&self, key: &str) -> String {
        format!("s3://{}/{}", self.store.bucket(), key)
    }
}

#[async_trait]
impl StorageProvider for DockerStorageProvider {
    async fn provision(&self, workspace_id: Uuid) -> ActuatorResult<()> {
        self.volumes.create(workspace_id).await
    }

    async fn restore(&self, workspace_id: Uuid, archive_key: &str) -> ActuatorResult<String> {
        self.jobs
            .run(&JobSpec {
                workspace_id,
                // The key embeds the op id that wrote it; reuse it so a
                // crashed restore resumed later lands on the same name.
                op_id: codehub_types::parse_archive_key(archive_key)
                    .map(|(_, op)| op)
                    .unwrap_or_else(Uuid::new_v4),
                mode: JobMode::Restore,
                archive_url: self.archive_url(archive_key),
            })
            .await?;
        Ok(archive_key.to_string())
    }

    async fn archive(&self, workspace_id: Uuid, op_id: Uuid) -> ActuatorResult<String> {
        let key = archive_key(workspace_id, op_id);
        self.jobs
            .run(&JobSpec {
                workspace_id,
                op_id,
                mode: JobMode::Archive,
                archive_url: self.archive_url(&key),
            })
            .await?;
        Ok(key)
    }

    async fn delete_volume(&self, workspace_id: Uuid) -> ActuatorResult<()> {
        self.volumes.remove(workspace_id).await
    }

    async fn volume_exists(&self, workspace_id: Uuid) -> ActuatorResult<bool> {
        self.volumes.exists(workspace_id).await
    }

    async fn archive_accessible(&self, archive_key: &str) -> ActuatorResult<(bool, String)> {
        self.store.archive_accessible(archive_key).await
    }

    async fn delete_archive(&self, archive_key: &str) -> ActuatorResult<()> {
        self.store.delete_archive(archive_key).await
    }
}
