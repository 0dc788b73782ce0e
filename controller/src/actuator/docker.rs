use crate::actuator::InstanceController;
use crate::error::{ActuatorError, ActuatorResult, start_failure};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, RemoveContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::service::{HostConfig, HealthStatusEnum};
use bollard::volume::CreateVolumeOptions;
use codehub_types::{container_name, volume_name};
use futures::StreamExt;
use std::time::Duration;
use uuid::Uuid;

/// Where the home volume appears inside the workspace container.
const HOME_MOUNT_PATH: &str = "/home/coder";

/// How long `start` waits for the container to begin serving before
/// giving up with HEALTH_CHECK_FAILED.
const START_WAIT: Duration = Duration::from_secs(120);
const START_POLL: Duration = Duration::from_secs(2);

const MANAGED_BY_LABEL: &str = "codehub.managed-by";
const WORKSPACE_LABEL: &str = "codehub.workspace-id";

/// Instance controller backed by the local Docker daemon.
pub struct DockerInstanceController {
    docker: Docker,
}

impl DockerInstanceController {
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn pull_image(&self, image_ref: &str) -> ActuatorResult<()> {
        let options = CreateImageOptions::<String> {
            from_image: image_ref.to_string(),
            ..CreateImageOptions::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(item) = stream.next().await {
            if let Err(e) = item {
                return Err(ActuatorError::action_failed(format!(
                    "{}: pulling {image_ref}: {e}",
                    start_failure::IMAGE_PULL_FAILED
                )));
            }
        }
        Ok(())
    }

    async fn remove_existing(&self, name: &str) -> ActuatorResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..RemoveContainerOptions::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(map_docker_error(e, "remove container")),
        }
    }

    async fn probe(&self, name: &str) -> ActuatorResult<RunState> {
        match self.docker.inspect_container(name, None).await {
            Ok(details) => {
                let state = details.state.unwrap_or_default();
                let running = state.running.unwrap_or(false);
                if !running {
                    return Ok(RunState::Stopped);
                }
                // A defined healthcheck gates readiness: Running alone is
                // not "would a proxy request succeed".
                let serving = match state.health.and_then(|h| h.status) {
                    None | Some(HealthStatusEnum::NONE) | Some(HealthStatusEnum::EMPTY) => true,
                    Some(HealthStatusEnum::HEALTHY) => true,
                    Some(_) => false,
                };
                Ok(if serving {
                    RunState::Serving
                } else {
                    RunState::Starting
                })
            }
            Err(e) if is_not_found(&e) => Ok(RunState::Absent),
            Err(e) => Err(map_docker_error(e, "inspect container")),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RunState {
    Absent,
    Stopped,
    Starting,
    Serving,
}

#[async_trait]
impl InstanceController for DockerInstanceController {
    async fn start(&self, workspace_id: Uuid, image_ref: &str) -> ActuatorResult<()> {
        let name = container_name(workspace_id);

        match self.probe(&name).await? {
            RunState::Serving => return Ok(()),
            RunState::Absent => {}
            // Exists but is not serving: remove and recreate rather than
            // coaxing an unknown container state back to life.
            RunState::Stopped | RunState::Starting => self.remove_existing(&name).await?,
        }

        self.pull_image(image_ref).await?;

        let config = Config::<String> {
            image: Some(image_ref.to_string()),
            labels: Some(
                [
                    (MANAGED_BY_LABEL.to_string(), "codehub".to_string()),
                    (WORKSPACE_LABEL.to_string(), workspace_id.to_string()),
                ]
                .into(),
            ),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{}",
                    volume_name(workspace_id),
                    HOME_MOUNT_PATH
                )]),
                ..HostConfig::default()
            }),
            ..Config::default()
        };
        let options = CreateContainerOptions::<String> {
            name: name.clone(),
            ..CreateContainerOptions::default()
        };
        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| {
                ActuatorError::action_failed(format!(
                    "{}: {e}",
                    start_failure::CONTAINER_CREATE_FAILED
                ))
            })?;
        self.docker
            .start_container::<String>(&name, None)
            .await
            .map_err(|e| {
                ActuatorError::action_failed(format!(
                    "{}: {e}",
                    start_failure::CONTAINER_CREATE_FAILED
                ))
            })?;

        // Block until the container accepts traffic; callers rely on
        // post-condition is_running == true.
        let deadline = tokio::time::Instant::now() + START_WAIT;
        loop {
            if self.probe(&name).await? == RunState::Serving {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ActuatorError::action_failed(format!(
                    "{}: {name} not serving after {START_WAIT:?}",
                    start_failure::HEALTH_CHECK_FAILED
                )));
            }
            tokio::time::sleep(START_POLL).await;
        }
    }

    async fn delete(&self, workspace_id: Uuid) -> ActuatorResult<()> {
        let name = container_name(workspace_id);
        // Immediate kill; ignore the result since the remove below is
        // forced anyway and the container may already be gone.
        let _ = self
            .docker
            .kill_container(&name, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await;
        self.remove_existing(&name).await
    }

    async fn is_running(&self, workspace_id: Uuid) -> ActuatorResult<bool> {
        Ok(self.probe(&container_name(workspace_id)).await? == RunState::Serving)
    }
}

/// Volume primitives shared by the docker-backed storage provider.
pub struct DockerVolumes {
    docker: Docker,
}

impl DockerVolumes {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    pub async fn create(&self, workspace_id: Uuid) -> ActuatorResult<()> {
        let options = CreateVolumeOptions::<String> {
            name: volume_name(workspace_id),
            labels: [
                (MANAGED_BY_LABEL.to_string(), "codehub".to_string()),
                (WORKSPACE_LABEL.to_string(), workspace_id.to_string()),
            ]
            .into(),
            ..CreateVolumeOptions::default()
        };
        // Volume creation is idempotent on the daemon side: an existing
        // name returns the existing volume.
        self.docker
            .create_volume(options)
            .await
            .map(|_| ())
            .map_err(|e| map_docker_error(e, "create volume"))
    }

    pub async fn remove(&self, workspace_id: Uuid) -> ActuatorResult<()> {
        match self
            .docker
            .remove_volume(&volume_name(workspace_id), None)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(map_docker_error(e, "remove volume")),
        }
    }

    pub async fn exists(&self, workspace_id: Uuid) -> ActuatorResult<bool> {
        match self.docker.inspect_volume(&volume_name(workspace_id)).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(map_docker_error(e, "inspect volume")),
        }
    }
}

pub(crate) fn is_not_found(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

pub(crate) fn map_docker_error(error: bollard::errors::Error, action: &str) -> ActuatorError {
    match error {
        bollard::errors::Error::DockerResponseServerError { status_code, message } => {
            ActuatorError::action_failed(format!("{action}: docker {status_code}: {message}"))
        }
        // Everything else (socket gone, hyper transport, serde) is the
        // daemon being unreachable rather than rejecting the action.
        other => ActuatorError::unreachable(format!("{action}: {other}")),
    }
}
