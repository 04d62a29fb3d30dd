//! Per-tag reconciliation: verify, then sign at most once.
//!
//! [`Reconciler::sync_tag`] re-evaluates one tracked record from scratch on
//! every dequeue:
//!
//! 1. record gone: nothing to do
//! 2. sticky failure: wait for the tracker to clear it
//! 3. no digest: fail the record
//! 4. already signed: nothing to do
//! 5. verify with the selected backend (may requeue or fail the record)
//! 6. sign and store the signature, unless running audit-only
//!
//! Signing and storage errors are returned to the worker pool for retry and
//! never recorded as audit failures.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::queue::{KeyHandler, WorkQueue};
use crate::release::{Release, ReleaseError, ReleaseSource};
use crate::signing::{SignError, SignatureStore, Signer, StoreError};
use crate::tracker::AuditTracker;
use crate::verify::{
    BackendChoice, JobVerifier, LocalVerifier, Verification, VerificationBackend, VerifyError,
};

/// Default deadline for persisting a signature.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(30);

/// Collaborators of a [`Reconciler`].
pub struct ReconcilerDeps {
    /// Registry of tracked tags.
    pub tracker: Arc<AuditTracker>,
    /// Queue tag names are re-added to when verification must be polled.
    pub queue: Arc<dyn WorkQueue>,
    /// Source of owning releases.
    pub releases: Arc<dyn ReleaseSource>,
    /// Signature store.
    pub store: Arc<dyn SignatureStore>,
    /// Signer; `None` runs in audit-only mode.
    pub signer: Option<Arc<dyn Signer>>,
    /// Host-local verification backend.
    pub local: LocalVerifier,
    /// Job verification backend.
    pub jobs: JobVerifier,
    /// CLI image pinned on the controller (`"local"` selects local verification).
    pub pinned_image: Option<String>,
    /// Deadline for persisting a signature.
    pub store_timeout: Duration,
}

/// How a reconciliation pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The record no longer exists.
    Missing,
    /// The record carries a sticky failure.
    AlreadyFailed,
    /// The record has no digest and was failed.
    NoDigest,
    /// The owning release no longer exists.
    ReleaseGone,
    /// A signature for the digest already exists.
    AlreadySigned,
    /// No CLI image is configured; the record stays pending.
    NoVerifier,
    /// Verification is throttled or in progress; the tag was requeued.
    Requeued(Duration),
    /// Verification failed and the record was failed.
    VerificationFailed,
    /// Verification succeeded in audit-only mode.
    Verified,
    /// The release was signed and the signature stored.
    Signed,
}

/// Errors returned to the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The owning release could not be loaded.
    #[error(transparent)]
    Release(#[from] ReleaseError),
    /// The verification backend failed.
    #[error(transparent)]
    Verify(#[from] VerifyError),
    /// Signing failed.
    #[error("unable to sign release: {0}")]
    Sign(#[from] SignError),
    /// Storing the signature failed.
    #[error("unable to upload release signature: {0}")]
    Store(#[from] StoreError),
    /// Storing the signature exceeded its deadline.
    #[error("unable to upload release signature: timed out after {seconds}s")]
    StoreTimeout {
        /// Deadline in seconds.
        seconds: u64,
    },
    /// Syncing a release panicked.
    #[error("audit sync of release {release} panicked: {message}")]
    Panicked {
        /// Release being synced.
        release: String,
        /// Panic payload.
        message: String,
    },
}

/// Drives tracked records through verification and signing.
pub struct Reconciler {
    deps: ReconcilerDeps,
}

impl Reconciler {
    /// Reconciler over `deps`.
    pub fn new(deps: ReconcilerDeps) -> Self {
        Self { deps }
    }

    /// The tracker this reconciler reads from.
    pub fn tracker(&self) -> &Arc<AuditTracker> {
        &self.deps.tracker
    }

    /// Load the release assembled from `namespace/name` and sync its tags.
    ///
    /// # Errors
    ///
    /// Returns an error if the release cannot be loaded or the sync panics.
    pub async fn sync_release(&self, namespace: &str, name: &str) -> Result<(), ReconcileError> {
        let Some(release) = self.deps.releases.load_release(namespace, name).await? else {
            return Ok(());
        };
        self.sync_release_description(&release)
    }

    /// Sync the tags of an already loaded release.
    ///
    /// A panic while syncing is converted into [`ReconcileError::Panicked`] so
    /// one malformed release cannot stop the loop feeding every other release.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync panics.
    pub fn sync_release_description(&self, release: &Release) -> Result<(), ReconcileError> {
        debug!(release = %release.config.name, "audit");
        std::panic::catch_unwind(AssertUnwindSafe(|| self.deps.tracker.sync(release))).map_err(
            |payload| ReconcileError::Panicked {
                release: release.config.name.clone(),
                message: panic_message(payload.as_ref()),
            },
        )
    }

    /// Reconcile the tracked tag `name` once.
    ///
    /// # Errors
    ///
    /// Returns an error when the release cannot be loaded, the job backend
    /// fails, or signing or storing the signature fails.
    pub async fn sync_tag(&self, name: &str) -> Result<SyncOutcome, ReconcileError> {
        let tracker = &self.deps.tracker;
        let Some(record) = tracker.get(name) else {
            return Ok(SyncOutcome::Missing);
        };

        if record.failure.is_some() {
            debug!(tag = %name, "release already failed, ignoring until retry interval is up");
            return Ok(SyncOutcome::AlreadyFailed);
        }

        if record.digest_id.is_empty() {
            let message = format!("Release {} has no digest and cannot be verified", record.name);
            debug!(tag = %name, %message, "failing release");
            tracker.set_failure(&record.name, &message);
            return Ok(SyncOutcome::NoDigest);
        }

        let Some(release) = self
            .deps
            .releases
            .load_release(&record.source_namespace, &record.source_name)
            .await?
        else {
            return Ok(SyncOutcome::ReleaseGone);
        };

        if self.deps.store.has_signature(&record.digest_id).await {
            trace!(digest = %record.digest_id, tag = %name, "release is already signed");
            return Ok(SyncOutcome::AlreadySigned);
        }

        let choice = BackendChoice::select(
            self.deps.pinned_image.as_deref(),
            release.config.override_cli_image.as_deref(),
        );
        let backend = match choice {
            Some(BackendChoice::Local) => VerificationBackend::Local(&self.deps.local),
            Some(BackendChoice::ClusterJob { image }) => VerificationBackend::ClusterJob {
                verifier: &self.deps.jobs,
                image,
            },
            None => {
                warn!(
                    tag = %name,
                    "unable to audit release, no pinned CLI image or override CLI image on the stream"
                );
                return Ok(SyncOutcome::NoVerifier);
            }
        };

        match backend.verify(&record, &release).await? {
            Verification::Verified => {}
            Verification::Requeue(delay) => {
                self.deps.queue.add_after(name, delay);
                return Ok(SyncOutcome::Requeued(delay));
            }
            Verification::Failed(message) => {
                tracker.set_failure(&record.name, &message);
                return Ok(SyncOutcome::VerificationFailed);
            }
        }

        let Some(signer) = &self.deps.signer else {
            info!(
                tag = %name,
                resource_version = %release.source.resource_version,
                "completed audit without signing"
            );
            return Ok(SyncOutcome::Verified);
        };

        let signature = signer.sign(&record.digest_id, &record.location).await?;

        let deadline = self.deps.store_timeout;
        tokio::time::timeout(
            deadline,
            self.deps.store.put_signature(&record.digest_id, &signature),
        )
        .await
        .map_err(|_| ReconcileError::StoreTimeout {
            seconds: deadline.as_secs(),
        })??;

        info!(digest = %record.digest_id, tag = %name, "signed and uploaded signature");
        Ok(SyncOutcome::Signed)
    }
}

#[async_trait::async_trait]
impl KeyHandler for Reconciler {
    type Error = ReconcileError;

    async fn handle(&self, key: &str) -> Result<(), Self::Error> {
        let outcome = self.sync_tag(key).await?;
        debug!(tag = %key, ?outcome, "audit sync finished");
        Ok(())
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("tracker", &self.deps.tracker)
            .field("pinned_image", &self.deps.pinned_image)
            .field("signing", &self.deps.signer.is_some())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_owned();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_owned()
}
