//! Verification job control plane.
//!
//! A job is a named, labelled batch unit that runs one container to
//! completion. The [`JobControlPlane`] trait hides where jobs actually run;
//! [`docker::DockerJobs`] runs them as Docker containers.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

pub mod docker;

/// Maximum job name length accepted by the scheduler.
pub const MAX_JOB_NAME_LEN: usize = 63;

/// Everything needed to create a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSpec {
    /// Deterministic job name.
    pub name: String,
    /// Image the job container runs.
    pub image: String,
    /// Container name inside the job.
    pub container_name: String,
    /// Command and arguments.
    pub command: Vec<String>,
    /// Selector-visible labels.
    pub labels: BTreeMap<String, String>,
    /// Informational annotations.
    pub annotations: BTreeMap<String, String>,
    /// Pull secret reference recorded on the job, if any.
    pub pull_secret_name: Option<String>,
}

/// Observed state of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Job {
    /// Job name.
    pub name: String,
    /// Labels on the job.
    pub labels: BTreeMap<String, String>,
    /// Annotations on the job.
    pub annotations: BTreeMap<String, String>,
    /// Pods currently backing the job.
    pub active: u32,
    /// Pods that succeeded.
    pub succeeded: u32,
    /// Pods that failed.
    pub failed: u32,
    /// Set once the job completed successfully.
    pub completion_time: Option<DateTime<Utc>>,
    /// Whether the job reached a terminal failed condition.
    pub failed_condition: bool,
}

/// Returns `(succeeded, complete)` for a job.
pub fn job_is_complete(job: &Job) -> (bool, bool) {
    if job.completion_time.is_some() {
        return (true, true);
    }
    if job.failed_condition {
        return (false, true);
    }
    (false, false)
}

/// Terminal state of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminatedState {
    /// When the container stopped.
    pub finished_at: DateTime<Utc>,
    /// Process exit code.
    pub exit_code: i32,
    /// Termination message left by the container.
    pub message: String,
}

/// State of one container instance inside a job pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    /// Container name.
    pub name: String,
    /// Present once the container has stopped.
    pub terminated: Option<TerminatedState>,
}

/// Pod phase filter applied when listing container statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    /// Every pod.
    Any,
    /// Pods that ended successfully.
    Succeeded,
    /// Pods that ended in failure.
    Failed,
}

/// Errors produced by job control plane operations.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Backend client failure.
    #[error("job backend failed: {0}")]
    Infrastructure(String),
    /// The job spec cannot be run.
    #[error("invalid job {name}: {reason}")]
    Invalid {
        /// Job name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Cluster-side job operations used by verification.
#[async_trait]
pub trait JobControlPlane: Send + Sync {
    /// Fetch a job by name.
    async fn get_job(&self, name: &str) -> Result<Option<Job>, JobError>;

    /// Create a job; returns the existing job when the name is already taken.
    async fn create_job(&self, spec: JobSpec) -> Result<Job, JobError>;

    /// List jobs carrying every label in `selector`.
    async fn list_jobs(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Job>, JobError>;

    /// Remove a finished job and its pods. Removing a missing job succeeds.
    async fn delete_job(&self, name: &str) -> Result<(), JobError>;

    /// List statuses of `container` across the job's pods in `phase`.
    async fn list_container_statuses(
        &self,
        job: &Job,
        phase: PodPhase,
        container: &str,
    ) -> Result<Vec<ContainerStatus>, JobError>;
}

/// Get a job by name, creating it from `build` when it does not exist.
///
/// # Errors
///
/// Returns an error if the lookup, the spec builder, or the creation fails.
pub async fn ensure_job<F>(
    plane: &dyn JobControlPlane,
    name: &str,
    build: F,
) -> Result<Job, JobError>
where
    F: FnOnce() -> Result<JobSpec, JobError> + Send,
{
    if let Some(job) = plane.get_job(name).await? {
        return Ok(job);
    }
    let spec = build()?;
    if spec.name != name {
        return Err(JobError::Invalid {
            name: spec.name,
            reason: format!("builder produced a spec for a different job than {name}"),
        });
    }
    plane.create_job(spec).await
}

/// Deterministic verification job name for a digest.
///
/// `sha256:abcd` becomes `verify-abcd`; any remaining `:` becomes `-` and the
/// result is cut to [`MAX_JOB_NAME_LEN`] bytes.
pub fn verify_job_name(digest: &str) -> String {
    let mut name = match digest.split_once(':') {
        Some((_, hex)) => format!("verify-{hex}"),
        None => digest.to_owned(),
    };
    name = name.replace(':', "-");
    if name.len() > MAX_JOB_NAME_LEN {
        let mut cut = MAX_JOB_NAME_LEN;
        while !name.is_char_boundary(cut) {
            cut = cut.saturating_sub(1);
        }
        name.truncate(cut);
    }
    name
}

/// Most recently terminated first; still-running containers sort last.
fn newest_termination_first(a: &ContainerStatus, b: &ContainerStatus) -> Ordering {
    match (&a.terminated, &b.terminated) {
        (Some(a), Some(b)) => b.finished_at.cmp(&a.finished_at),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Retrieve the termination message of the newest terminated container.
///
/// Returns `(message, exit_code)`. Jobs with no active pods are skipped.
/// With `only_success`, containers that exited non-zero are passed over.
pub async fn termination_message(
    plane: &dyn JobControlPlane,
    job: &Job,
    phase: PodPhase,
    container: &str,
    only_success: bool,
) -> Option<(String, i32)> {
    if job.active == 0 {
        debug!(job = %job.name, "deferring pod lookup, no active pods");
        return None;
    }
    let mut statuses = match plane.list_container_statuses(job, phase, container).await {
        Ok(statuses) => statuses,
        Err(e) => {
            debug!(job = %job.name, error = %e, "unable to list job containers");
            return None;
        }
    };
    statuses.sort_by(newest_termination_first);

    statuses
        .into_iter()
        .filter_map(|status| status.terminated)
        .find(|terminated| !only_success || terminated.exit_code == 0)
        .map(|terminated| (terminated.message, terminated.exit_code))
}
