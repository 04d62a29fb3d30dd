//! Admission throttle for verification jobs.
//!
//! The count is re-derived from the job control plane on every check, so the
//! limit holds across controller restarts without any local bookkeeping.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::jobs::JobControlPlane;
use crate::release::ANNOTATION_JOB_PURPOSE;

/// Purpose label value carried by verification jobs.
pub const AUDIT_PURPOSE: &str = "audit";

/// Default cap on concurrently unfinished verification jobs.
pub const DEFAULT_MAX_UNFINISHED_JOBS: usize = 2;

/// Label selector matching every verification job.
pub fn audit_job_selector() -> BTreeMap<String, String> {
    BTreeMap::from([(ANNOTATION_JOB_PURPOSE.to_owned(), AUDIT_PURPOSE.to_owned())])
}

/// Refuses new verification jobs while too many are unfinished.
#[derive(Clone)]
pub struct JobAdmissionThrottle {
    jobs: Arc<dyn JobControlPlane>,
    limit: usize,
}

impl JobAdmissionThrottle {
    /// Throttle allowing at most `limit` unfinished jobs.
    pub fn new(jobs: Arc<dyn JobControlPlane>, limit: usize) -> Self {
        Self { jobs, limit }
    }

    /// Configured limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of verification jobs without a completion time.
    ///
    /// Returns `None` when the jobs cannot be listed.
    pub async fn count_unfinished(&self) -> Option<usize> {
        match self.jobs.list_jobs(&audit_job_selector()).await {
            Ok(jobs) => Some(
                jobs.iter()
                    .filter(|job| job.completion_time.is_none())
                    .count(),
            ),
            Err(e) => {
                debug!(error = %e, "unable to list verification jobs");
                None
            }
        }
    }

    /// Whether one more job may be dispatched. Fails closed when the count is unknown.
    pub async fn admits(&self) -> bool {
        match self.count_unfinished().await {
            Some(count) => count < self.limit,
            None => false,
        }
    }
}

impl std::fmt::Debug for JobAdmissionThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobAdmissionThrottle")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}
