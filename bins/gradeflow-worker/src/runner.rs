//! Sandboxed Test Runner
//!
//! **Core Responsibility:**
//! Run one container against a submission/framework pair and hand back the
//! captured output and exit status.
//!
//! **Boundary:**
//! - The runner knows HOW to execute (Docker today)
//! - It does NOT decide pass/fail and does NOT sanitize logs, see `outcome`
//! - A non-zero exit is data, not an error; errors are timeouts and runtime failures
//!
//! Every run is bounded by a wall-clock limit. When the limit expires the
//! in-flight Docker calls are dropped and the container is force-removed.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub const SUBMISSION_MOUNT: &str = "/data/submission.zip";
pub const FRAMEWORK_MOUNT: &str = "/data/unittest.zip";

/// Upper bound for removing a container after a run
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    pub image: &'a str,
    pub submission: &'a Path,
    pub framework: &'a Path,
    pub max_memory_bytes: i64,
}

/// Raw result of a finished container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    /// Combined stdout and stderr
    pub output: String,
    pub exit_code: i64,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("execution exceeded {0:?}")]
    Timeout(Duration),
    #[error("container could not be launched: {0}")]
    Launch(String),
    #[error("container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),
    #[error("cannot resolve mount source: {0}")]
    Mount(#[from] std::io::Error),
}

/// Execution engine seam: Docker in production, scripted doubles in tests
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, request: &RunRequest<'_>) -> Result<RunOutput, RunnerError>;
}

/// Await `work` for at most `limit`
pub async fn bounded<T, F>(limit: Duration, work: F) -> Result<T, RunnerError>
where
    F: Future<Output = Result<T, RunnerError>>,
{
    match tokio::time::timeout(limit, work).await {
        Ok(result) => result,
        Err(_) => Err(RunnerError::Timeout(limit)),
    }
}

/// Docker-based runner
///
/// **Container Rules:**
/// 1. Image comes from the job message, pulled if not present
/// 2. Network disabled
/// 3. Memory ceiling enforced, no additional swap
/// 4. Submission and framework bind-mounted read-only under `/data`
/// 5. Container force-removed after every run, including timeouts
pub struct DockerRunner {
    docker: Docker,
    timeout: Duration,
}

impl DockerRunner {
    /// Connect to the local daemon and make sure it answers
    pub async fn connect(timeout: Duration) -> Result<Self, RunnerError> {
        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;
        Ok(Self { docker, timeout })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RunnerError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!(image, "Pulling image");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }

    async fn execute(&self, name: &str, request: &RunRequest<'_>) -> Result<RunOutput, RunnerError> {
        self.ensure_image(request.image).await?;

        let submission = tokio::fs::canonicalize(request.submission).await?;
        let framework = tokio::fs::canonicalize(request.framework).await?;

        let config = Config {
            image: Some(request.image.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(request.max_memory_bytes),
                memory_swap: Some(request.max_memory_bytes),
                mounts: Some(vec![
                    read_only_bind(&submission, SUBMISSION_MOUNT),
                    read_only_bind(&framework, FRAMEWORK_MOUNT),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| RunnerError::Launch(e.to_string()))?;

        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RunnerError::Launch(e.to_string()))?;

        let mut wait = self.docker.wait_container(
            name,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        let exit_code = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(RunnerError::Launch(
                    "container wait ended without a status".to_string(),
                ))
            }
        };

        let mut output = String::new();
        let mut logs = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: false,
                ..Default::default()
            }),
        );
        while let Some(chunk) = logs.next().await {
            output.push_str(&String::from_utf8_lossy(&chunk?.into_bytes()));
        }

        Ok(RunOutput { output, exit_code })
    }

    async fn discard(&self, name: &str) {
        let remove = self.docker.remove_container(
            name,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        );
        match tokio::time::timeout(CLEANUP_TIMEOUT, remove).await {
            Ok(Ok(())) => {}
            // never created, nothing to remove
            Ok(Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. })) => {}
            Ok(Err(e)) => tracing::warn!(container = name, error = %e, "Failed to remove container"),
            Err(_) => tracing::warn!(container = name, "Timed out removing container"),
        }
    }
}

fn read_only_bind(source: &Path, target: &str) -> Mount {
    Mount {
        target: Some(target.to_string()),
        source: Some(source.to_string_lossy().into_owned()),
        typ: Some(MountTypeEnum::BIND),
        read_only: Some(true),
        ..Default::default()
    }
}

#[async_trait]
impl TestRunner for DockerRunner {
    async fn run(&self, request: &RunRequest<'_>) -> Result<RunOutput, RunnerError> {
        let name = format!("gradeflow-{}", Uuid::new_v4());
        tracing::debug!(container = %name, image = request.image, "Starting container");

        let result = bounded(self.timeout, self.execute(&name, request)).await;
        self.discard(&name).await;
        result
    }
}
