//! Verification through dispatched jobs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::jobs::{
    ensure_job, job_is_complete, termination_message, verify_job_name, JobControlPlane, JobSpec,
    PodPhase,
};
use crate::release::{
    Release, ANNOTATION_JOB_PURPOSE, ANNOTATION_RELEASE_TAG, ANNOTATION_SOURCE, ANNOTATION_TARGET,
};
use crate::throttle::{JobAdmissionThrottle, AUDIT_PURPOSE};
use crate::tracker::AuditRecord;

use super::{Verification, VerifyError};

/// Container name of the verification step inside a job.
pub const VERIFY_CONTAINER: &str = "verify";

/// Failure message used when a failed job left no diagnostics.
pub const UNKNOWN_FAILURE: &str = "Unable to verify release for unknown reason";

/// Dispatches and polls one verification job per digest.
///
/// Finished jobs are deleted once their outcome has been read, so they stop
/// counting against the throttle and a retried digest gets a fresh job.
#[derive(Clone)]
pub struct JobVerifier {
    jobs: Arc<dyn JobControlPlane>,
    throttle: JobAdmissionThrottle,
    requeue_delay: Duration,
}

impl JobVerifier {
    /// Verifier dispatching through `jobs`, gated by `throttle`.
    pub fn new(
        jobs: Arc<dyn JobControlPlane>,
        throttle: JobAdmissionThrottle,
        requeue_delay: Duration,
    ) -> Self {
        Self {
            jobs,
            throttle,
            requeue_delay,
        }
    }

    /// Verify `record` with a job running `image`.
    ///
    /// # Errors
    ///
    /// Returns an error when the job cannot be looked up, created, or deleted.
    pub async fn verify(
        &self,
        record: &AuditRecord,
        release: &Release,
        image: &str,
    ) -> Result<Verification, VerifyError> {
        let name = verify_job_name(&record.digest_id);

        let job = match self.jobs.get_job(&name).await? {
            Some(job) => job,
            None => {
                if !self.throttle.admits().await {
                    debug!(
                        tag = %record.name,
                        limit = self.throttle.limit(),
                        "throttling verification jobs"
                    );
                    return Ok(Verification::Requeue(self.requeue_delay));
                }
                ensure_job(self.jobs.as_ref(), &name, || {
                    info!(
                        digest = %record.digest_id,
                        tag = %record.name,
                        job = %name,
                        "running release verify job"
                    );
                    Ok(verify_job_spec(&name, image, record, release))
                })
                .await?
            }
        };

        match job_is_complete(&job) {
            (_, false) => Ok(Verification::Requeue(self.requeue_delay)),
            (false, true) => {
                let message = termination_message(
                    self.jobs.as_ref(),
                    &job,
                    PodPhase::Failed,
                    VERIFY_CONTAINER,
                    false,
                )
                .await
                .map(|(message, _)| message)
                .filter(|message| !message.is_empty())
                .map_or_else(
                    || UNKNOWN_FAILURE.to_owned(),
                    |message| format!("Unable to verify release:\n\n{message}"),
                );
                debug!(tag = %record.name, %message, "release verification job failed");
                self.jobs.delete_job(&job.name).await?;
                Ok(Verification::Failed(message))
            }
            (true, true) => {
                self.jobs.delete_job(&job.name).await?;
                Ok(Verification::Verified)
            }
        }
    }
}

/// Job spec verifying `record` with `image`.
pub fn verify_job_spec(name: &str, image: &str, record: &AuditRecord, release: &Release) -> JobSpec {
    let labels = BTreeMap::from([(ANNOTATION_JOB_PURPOSE.to_owned(), AUDIT_PURPOSE.to_owned())]);
    let annotations = BTreeMap::from([
        (
            ANNOTATION_SOURCE.to_owned(),
            format!("{}/{}", release.source.namespace, release.source.name),
        ),
        (
            ANNOTATION_TARGET.to_owned(),
            format!("{}/{}", release.target.namespace, release.target.name),
        ),
        (ANNOTATION_RELEASE_TAG.to_owned(), record.name.clone()),
        (ANNOTATION_JOB_PURPOSE.to_owned(), AUDIT_PURPOSE.to_owned()),
    ]);

    JobSpec {
        name: name.to_owned(),
        image: image.to_owned(),
        container_name: VERIFY_CONTAINER.to_owned(),
        command: vec![
            "/bin/bash".to_owned(),
            "-c".to_owned(),
            r#"set -euo pipefail
oc adm release info --verify "$1""#
                .to_owned(),
            String::new(),
            record.location.clone(),
        ],
        labels,
        annotations,
        pull_secret_name: release.config.pull_secret_name.clone(),
    }
}

impl std::fmt::Debug for JobVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobVerifier")
            .field("throttle", &self.throttle)
            .field("requeue_delay", &self.requeue_delay)
            .finish_non_exhaustive()
    }
}
