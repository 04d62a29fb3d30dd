//! Docker-backed job control plane.
//!
//! Each job is one container named after the job. Job labels and annotations
//! are both stored as container labels; the container is the job's only pod
//! and stays inspectable until [`JobControlPlane::delete_job`] removes it.
//! Docker has no termination message file, so the tail of the container log
//! stands in for it.

use std::collections::{BTreeMap, HashMap};

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum, HostConfig};
use bollard::Docker;
use chrono::{DateTime, Utc};
use tokio_stream::StreamExt;
use tracing::{debug, info};

use super::{ContainerStatus, Job, JobControlPlane, JobError, JobSpec, PodPhase, TerminatedState};

/// Label holding the container name a job was created with.
pub const CONTAINER_NAME_LABEL: &str = "release-auditor/container";
/// Label scoping jobs to the auditor's namespace.
pub const NAMESPACE_LABEL: &str = "release-auditor/namespace";
/// Label recording the pull secret a job was created with.
///
/// Informational only: images are pulled with the daemon's own registry
/// credentials.
pub const PULL_SECRET_LABEL: &str = "release-auditor/pull-secret";
/// Prefix marking labels that were job annotations.
const ANNOTATION_PREFIX: &str = "annotation.";

/// Job control plane running jobs as Docker containers.
#[derive(Debug, Clone)]
pub struct DockerJobs {
    docker: Docker,
    namespace: String,
    log_tail_lines: usize,
}

impl DockerJobs {
    /// Connect to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns an error when the Docker client cannot be configured.
    pub fn connect(namespace: &str, log_tail_lines: usize) -> Result<Self, JobError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| JobError::Infrastructure(e.to_string()))?;
        Ok(Self::new(docker, namespace, log_tail_lines))
    }

    /// Wrap an existing client.
    pub fn new(docker: Docker, namespace: &str, log_tail_lines: usize) -> Self {
        Self {
            docker,
            namespace: namespace.to_owned(),
            log_tail_lines,
        }
    }

    /// Returns true if the Docker daemon answers a ping.
    pub async fn available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerInspectResponse>, JobError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => Ok(Some(response)),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(JobError::Infrastructure(e.to_string())),
        }
    }

    async fn start(&self, name: &str) -> Result<(), JobError> {
        match self
            .docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            // 304: already started.
            Ok(())
            | Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(JobError::Infrastructure(e.to_string())),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), JobError> {
        info!(image, "pulling verification image");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(chunk) = stream.next().await {
            chunk.map_err(|e| JobError::Infrastructure(format!("failed to pull {image}: {e}")))?;
        }
        Ok(())
    }

    async fn create_container(&self, spec: &JobSpec) -> Result<(), BollardError> {
        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        });
        self.docker
            .create_container(options, build_container_config(spec, &self.namespace))
            .await?;
        Ok(())
    }

    async fn log_tail(&self, name: &str) -> Result<String, JobError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: self.log_tail_lines.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            let log = chunk.map_err(|e| JobError::Infrastructure(e.to_string()))?;
            output.push_str(&log.to_string());
        }
        Ok(output.trim().to_owned())
    }
}

#[async_trait::async_trait]
impl JobControlPlane for DockerJobs {
    async fn get_job(&self, name: &str) -> Result<Option<Job>, JobError> {
        let Some(mut response) = self.inspect(name).await? else {
            return Ok(None);
        };
        if never_started(&response) {
            info!(job = %name, "starting job that was created but never started");
            self.start(name).await?;
            response = match self.inspect(name).await? {
                Some(response) => response,
                None => return Ok(None),
            };
        }
        Ok(Some(job_from_inspect(name, &response)))
    }

    async fn create_job(&self, spec: JobSpec) -> Result<Job, JobError> {
        match self.create_container(&spec).await {
            Ok(()) => {}
            Err(BollardError::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                debug!(job = %spec.name, "job already exists");
                return self.get_job(&spec.name).await?.ok_or_else(|| {
                    JobError::Infrastructure(format!("job {} vanished after conflict", spec.name))
                });
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                self.pull_image(&spec.image).await?;
                self.create_container(&spec)
                    .await
                    .map_err(|e| JobError::Infrastructure(e.to_string()))?;
            }
            Err(e) => return Err(JobError::Infrastructure(e.to_string())),
        }

        self.start(&spec.name).await?;
        info!(job = %spec.name, image = %spec.image, "started job");

        self.get_job(&spec.name)
            .await?
            .ok_or_else(|| JobError::Infrastructure(format!("job {} vanished after start", spec.name)))
    }

    async fn list_jobs(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Job>, JobError> {
        let mut labels: Vec<String> = selector.iter().map(|(k, v)| format!("{k}={v}")).collect();
        labels.push(format!("{NAMESPACE_LABEL}={}", self.namespace));
        let options = Some(ListContainersOptions {
            all: true,
            filters: HashMap::from([("label".to_owned(), labels)]),
            ..Default::default()
        });

        let summaries = self
            .docker
            .list_containers(options)
            .await
            .map_err(|e| JobError::Infrastructure(e.to_string()))?;

        let mut jobs = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(name) = summary
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|name| name.trim_start_matches('/').to_owned())
            else {
                continue;
            };
            // Completion time is only available from a full inspect.
            if let Some(job) = self.get_job(&name).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn delete_job(&self, name: &str) -> Result<(), JobError> {
        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        match self.docker.remove_container(name, options).await {
            Ok(()) => {
                debug!(job = %name, "removed job");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(JobError::Infrastructure(e.to_string())),
        }
    }

    async fn list_container_statuses(
        &self,
        job: &Job,
        phase: PodPhase,
        container: &str,
    ) -> Result<Vec<ContainerStatus>, JobError> {
        let Some(response) = self.inspect(&job.name).await? else {
            return Ok(Vec::new());
        };
        let labels = response
            .config
            .as_ref()
            .and_then(|config| config.labels.clone())
            .unwrap_or_default();
        if labels.get(CONTAINER_NAME_LABEL).map(String::as_str) != Some(container) {
            return Ok(Vec::new());
        }

        let terminated = terminated_state(&response);
        let in_phase = match (&terminated, phase) {
            (_, PodPhase::Any) => true,
            (Some(t), PodPhase::Failed) => t.exit_code != 0,
            (Some(t), PodPhase::Succeeded) => t.exit_code == 0,
            (None, _) => false,
        };
        if !in_phase {
            return Ok(Vec::new());
        }

        let terminated = match terminated {
            Some(mut state) => {
                state.message = self.log_tail(&job.name).await?;
                Some(state)
            }
            None => None,
        };
        Ok(vec![ContainerStatus {
            name: container.to_owned(),
            terminated,
        }])
    }
}

fn build_container_config(spec: &JobSpec, namespace: &str) -> ContainerConfig<String> {
    let mut labels: HashMap<String, String> = spec.labels.clone().into_iter().collect();
    for (key, value) in &spec.annotations {
        labels.insert(format!("{ANNOTATION_PREFIX}{key}"), value.clone());
    }
    labels.insert(CONTAINER_NAME_LABEL.to_owned(), spec.container_name.clone());
    labels.insert(NAMESPACE_LABEL.to_owned(), namespace.to_owned());
    if let Some(secret) = &spec.pull_secret_name {
        labels.insert(PULL_SECRET_LABEL.to_owned(), secret.clone());
    }

    let mut tmpfs: HashMap<String, String> = HashMap::new();
    tmpfs.insert("/tmp".to_owned(), "rw,size=512m".to_owned());

    let host_config = HostConfig {
        readonly_rootfs: Some(true),
        cap_drop: Some(vec!["ALL".to_owned()]),
        security_opt: Some(vec!["no-new-privileges:true".to_owned()]),
        pids_limit: Some(256),
        tmpfs: Some(tmpfs),
        ..Default::default()
    };

    ContainerConfig {
        image: Some(spec.image.clone()),
        cmd: Some(spec.command.clone()),
        env: Some(vec!["HOME=/tmp".to_owned()]),
        labels: Some(labels),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn job_from_inspect(name: &str, response: &ContainerInspectResponse) -> Job {
    let mut labels = BTreeMap::new();
    let mut annotations = BTreeMap::new();
    let container_labels = response
        .config
        .as_ref()
        .and_then(|config| config.labels.clone())
        .unwrap_or_default();
    for (key, value) in container_labels {
        match key.strip_prefix(ANNOTATION_PREFIX) {
            Some(annotation) => {
                annotations.insert(annotation.to_owned(), value);
            }
            None => {
                labels.insert(key, value);
            }
        }
    }

    let mut job = Job {
        name: name.to_owned(),
        labels,
        annotations,
        active: 1,
        ..Default::default()
    };
    if let Some(terminated) = terminated_state(response) {
        if terminated.exit_code == 0 {
            job.succeeded = 1;
            job.completion_time = Some(terminated.finished_at);
        } else {
            job.failed = 1;
            job.failed_condition = true;
        }
    }
    job
}

/// A container whose start failed after creation sits in `created` forever.
fn never_started(response: &ContainerInspectResponse) -> bool {
    response
        .state
        .as_ref()
        .and_then(|state| state.status)
        .is_some_and(|status| status == ContainerStateStatusEnum::CREATED)
}

fn terminated_state(response: &ContainerInspectResponse) -> Option<TerminatedState> {
    let state = response.state.as_ref()?;
    if state.running.unwrap_or(false) {
        return None;
    }
    let finished_at = state.finished_at.as_deref().and_then(parse_docker_time)?;
    let exit_code = state
        .exit_code
        .and_then(|code| i32::try_from(code).ok())
        .unwrap_or(-1);
    Some(TerminatedState {
        finished_at,
        exit_code,
        message: String::new(),
    })
}

/// Docker reports `0001-01-01T00:00:00Z` for containers that never stopped.
fn parse_docker_time(raw: &str) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw).ok()?.with_timezone(&Utc);
    (parsed.timestamp() > 0).then_some(parsed)
}
