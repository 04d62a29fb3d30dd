//! Verification backends.
//!
//! A release is verified either by running the CLI on this host
//! ([`LocalVerifier`]) or by dispatching a verification job
//! ([`JobVerifier`]). The backend is chosen per reconciliation from the
//! pinned and per-release CLI images; see [`BackendChoice::select`].

use std::time::Duration;

use crate::jobs::JobError;
use crate::release::Release;
use crate::tracker::AuditRecord;

pub mod job;
pub mod local;

pub use job::JobVerifier;
pub use local::LocalVerifier;

/// Pinned image value selecting host-local verification.
pub const LOCAL_IMAGE: &str = "local";

/// Which backend verifies a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendChoice {
    /// Run the CLI on this host.
    Local,
    /// Dispatch a verification job running `image`.
    ClusterJob {
        /// CLI image the job runs.
        image: String,
    },
}

impl BackendChoice {
    /// Resolve the backend from the controller's pinned image, falling back to
    /// the release's override image. Returns `None` when neither is set.
    pub fn select(pinned_image: Option<&str>, release_override: Option<&str>) -> Option<Self> {
        let image = pinned_image
            .filter(|image| !image.is_empty())
            .or_else(|| release_override.filter(|image| !image.is_empty()))?;
        if image == LOCAL_IMAGE {
            return Some(Self::Local);
        }
        Some(Self::ClusterJob {
            image: image.to_owned(),
        })
    }
}

/// Result of one verification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// The release verified; signing may proceed.
    Verified,
    /// The release failed verification with a diagnostic message.
    Failed(String),
    /// Verification is throttled or still running; look again after the delay.
    Requeue(Duration),
}

/// Errors that abort a verification pass without judging the release.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// The job control plane failed.
    #[error("unable to verify release before signing: {0}")]
    Jobs(#[from] JobError),
}

/// A selected backend, ready to verify one record.
#[derive(Debug)]
pub enum VerificationBackend<'a> {
    /// Host-local CLI.
    Local(&'a LocalVerifier),
    /// Verification job.
    ClusterJob {
        /// Job dispatcher.
        verifier: &'a JobVerifier,
        /// CLI image the job runs.
        image: String,
    },
}

impl VerificationBackend<'_> {
    /// Verify the artifact described by `record`.
    ///
    /// # Errors
    ///
    /// Returns an error when the job control plane cannot be reached.
    pub async fn verify(
        &self,
        record: &AuditRecord,
        release: &Release,
    ) -> Result<Verification, VerifyError> {
        match self {
            Self::Local(verifier) => Ok(verifier.verify(&record.location).await),
            Self::ClusterJob { verifier, image } => verifier.verify(record, release, image).await,
        }
    }
}
