use crate::actuator::docker::{is_not_found, map_docker_error};
use crate::error::{ActuatorError, ActuatorResult};
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogsOptions, RemoveContainerOptions,
    WaitContainerOptions,
};
use bollard::service::HostConfig;
use codehub_types::{ErrorReason, volume_name};
use futures::StreamExt;
use std::time::Duration;
use uuid::Uuid;

/// Self-imposed job deadline plus slack for container teardown. The job
/// aborts itself at 30 minutes; the controller only discovers the corpse.
const JOB_WAIT: Duration = Duration::from_secs(31 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobMode {
    Archive,
    Restore,
}

impl JobMode {
    fn as_str(self) -> &'static str {
        match self {
            JobMode::Archive => "archive",
            JobMode::Restore => "restore",
        }
    }
}

/// Everything a worker container needs. The job never constructs object
/// paths itself; `archive_url` arrives fully resolved.
pub struct JobSpec {
    pub workspace_id: Uuid,
    pub op_id: Uuid,
    pub mode: JobMode,
    pub archive_url: String,
}

/// S3 wiring handed to every job container via env.
#[derive(Clone)]
pub struct JobEnv {
    pub image: String,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

/// Runs archive/restore worker containers against the local daemon.
pub struct JobRunner {
    docker: Docker,
    env: JobEnv,
}

impl JobRunner {
    pub fn new(docker: Docker, env: JobEnv) -> Self {
        Self { docker, env }
    }

    pub async fn run(&self, spec: &JobSpec) -> ActuatorResult<()> {
        let name = job_container_name(spec);

        // A previous attempt may have left a finished container behind;
        // re-running with the same op_id must start clean.
        self.remove(&name).await?;

        let config = Config::<String> {
            image: Some(self.env.image.clone()),
            cmd: Some(vec![spec.mode.as_str().to_string()]),
            env: Some(vec![
                format!("ARCHIVE_URL={}", spec.archive_url),
                format!("S3_ENDPOINT={}", self.env.endpoint),
                format!("S3_ACCESS_KEY={}", self.env.access_key),
                format!("S3_SECRET_KEY={}", self.env.secret_key),
            ]),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:/data", volume_name(spec.workspace_id))]),
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
            .map_err(|e| map_docker_error(e, "create job container"))?;
        self.docker
            .start_container::<String>(&name, None)
            .await
            .map_err(|e| map_docker_error(e, "start job container"))?;

        let exit_code = match tokio::time::timeout(JOB_WAIT, self.wait(&name)).await {
            Ok(result) => result?,
            Err(_) => {
                // The job failed to honor its own deadline; put it down.
                let _ = self
                    .docker
                    .kill_container(&name, Some(KillContainerOptions { signal: "SIGKILL" }))
                    .await;
                self.remove(&name).await?;
                return Err(ActuatorError::action_failed(format!(
                    "job {name} did not finish within {JOB_WAIT:?}"
                )));
            }
        };

        let logs = self.collect_logs(&name).await.unwrap_or_default();
        self.remove(&name).await?;

        // Exit code alone determines success; the log tag only classifies
        // the failure.
        if exit_code == 0 {
            return Ok(());
        }
        let report = parse_job_logs(&logs);
        Err(classify_job_failure(exit_code, &report))
    }

    async fn wait(&self, name: &str) -> ActuatorResult<i64> {
        let mut stream = self.docker.wait_container(
            name,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // The daemon reports non-zero exits of some runtimes as an
            // error value carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(map_docker_error(e, "wait job container")),
            None => Err(ActuatorError::unreachable(format!(
                "wait stream for {name} ended without a status"
            ))),
        }
    }

    async fn collect_logs(&self, name: &str) -> ActuatorResult<String> {
        let mut stream = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: "200".to_string(),
                ..LogsOptions::default()
            }),
        );
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => out.push_str(&log.to_string()),
                Err(e) => return Err(map_docker_error(e, "read job logs")),
            }
        }
        Ok(out)
    }

    async fn remove(&self, name: &str) -> ActuatorResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..RemoveContainerOptions::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(map_docker_error(e, "remove job container")),
        }
    }
}

fn job_container_name(spec: &JobSpec) -> String {
    format!(
        "ws-{}-{}-{}",
        spec.workspace_id,
        spec.mode.as_str(),
        spec.op_id.simple()
    )
}

/// Structured `KEY=VALUE` lines a job emits on stdout.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct JobReport {
    pub steps: Vec<String>,
    pub result: Option<String>,
    pub error_code: Option<String>,
}

pub fn parse_job_logs(logs: &str) -> JobReport {
    let mut report = JobReport::default();
    for line in logs.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "STEP" => report.steps.push(value.to_string()),
            "RESULT" => report.result = Some(value.to_string()),
            "CODEHUB_ERROR" => report.error_code = Some(value.to_string()),
            _ => {}
        }
    }
    report
}

/// Map the job's error tag onto the row-level taxonomy. Unknown or absent
/// tags degrade to a retryable ActionFailed: the exit code already said
/// the attempt failed.
pub fn classify_job_failure(exit_code: i64, report: &JobReport) -> ActuatorError {
    let code = report.error_code.as_deref().unwrap_or("");
    match code {
        "S3_ACCESS_ERROR" => ActuatorError::unreachable(format!("job: {code}")),
        "ARCHIVE_NOT_FOUND" | "META_NOT_FOUND" | "CHECKSUM_MISMATCH" => {
            ActuatorError::data_lost(format!("job: {code}"))
        }
        "DISK_FULL" => {
            ActuatorError::non_retryable(ErrorReason::ActionFailed, format!("job: {code}"))
        }
        "TAR_EXTRACT_FAILED" => ActuatorError::action_failed(format!("job: {code}")),
        _ => ActuatorError::action_failed(format!(
            "job exited with status {exit_code}{}",
            report
                .result
                .as_deref()
                .map(|r| format!(" (RESULT={r})"))
                .unwrap_or_default()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_lines_and_ignores_noise() {
        let logs = "\
STEP=download
progress 13%
STEP=verify
CODEHUB_ERROR=CHECKSUM_MISMATCH
RESULT=FAIL
";
        let report = parse_job_logs(logs);
        assert_eq!(report.steps, vec!["download", "verify"]);
        assert_eq!(report.result.as_deref(), Some("FAIL"));
        assert_eq!(report.error_code.as_deref(), Some("CHECKSUM_MISMATCH"));
    }

    #[test]
    fn classification_follows_the_error_table() {
        let report = |code: &str| JobReport {
            error_code: Some(code.to_string()),
            ..JobReport::default()
        };

        let e = classify_job_failure(1, &report("S3_ACCESS_ERROR"));
        assert_eq!(e.reason, ErrorReason::Unreachable);
        assert!(e.retryable);

        for code in ["ARCHIVE_NOT_FOUND", "META_NOT_FOUND", "CHECKSUM_MISMATCH"] {
            let e = classify_job_failure(1, &report(code));
            assert_eq!(e.reason, ErrorReason::DataLost);
            assert!(!e.retryable);
        }

        let e = classify_job_failure(1, &report("TAR_EXTRACT_FAILED"));
        assert_eq!(e.reason, ErrorReason::ActionFailed);
        assert!(e.retryable);

        let e = classify_job_failure(1, &report("DISK_FULL"));
        assert_eq!(e.reason, ErrorReason::ActionFailed);
        assert!(!e.retryable);
    }

    #[test]
    fn missing_tag_degrades_to_retryable_action_failed() {
        let e = classify_job_failure(137, &JobReport::default());
        assert_eq!(e.reason, ErrorReason::ActionFailed);
        assert!(e.retryable);
        assert!(e.message.contains("137"));
    }
}
