//! Registry of release tags under audit.
//!
//! The [`AuditTracker`] owns one [`AuditRecord`] per release tag and is the
//! only shared mutable state of the auditor. Every read and write goes
//! through a single mutex that is never held across an await or an external
//! call; queue notifications are issued after the lock is released.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::queue::WorkQueue;
use crate::release::{PublishMode, Release};

/// Reason recorded for verification failures.
pub const REASON_VERIFICATION_FAILED: &str = "VerificationFailed";

/// Default time after which a failed record is retried.
pub const DEFAULT_FAILURE_COOLDOWN: Duration = Duration::from_secs(43_200);

/// Why a record stopped progressing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditFailure {
    /// Machine-readable reason.
    pub reason: String,
    /// Human-readable diagnostic.
    pub message: String,
}

/// Audit state of a single release tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    /// Last structural observation or failure-cooldown reset.
    pub observed_at: DateTime<Utc>,
    /// Release tag name, unique across the tracker.
    pub name: String,
    /// Content digest; empty means the tag cannot be verified.
    pub digest_id: String,
    /// Pull spec the artifact is fetched from.
    pub location: String,
    /// Owning release.
    pub release_name: String,
    /// Namespace of the stream the release was assembled from.
    pub source_namespace: String,
    /// Name of the stream the release was assembled from.
    pub source_name: String,
    /// Sticky failure; while set, reconciliation is a no-op.
    pub failure: Option<AuditFailure>,
}

/// Concurrency-safe registry of [`AuditRecord`]s keyed by tag name.
pub struct AuditTracker {
    records: Mutex<HashMap<String, AuditRecord>>,
    queue: Arc<dyn WorkQueue>,
    clock: Arc<dyn Clock>,
    cooldown: chrono::Duration,
}

impl AuditTracker {
    /// Tracker scheduling work on `queue`, using the system clock.
    pub fn new(queue: Arc<dyn WorkQueue>) -> Self {
        Self::with_clock(queue, Arc::new(SystemClock), DEFAULT_FAILURE_COOLDOWN)
    }

    /// Tracker with an explicit clock and failure cooldown.
    pub fn with_clock(queue: Arc<dyn WorkQueue>, clock: Arc<dyn Clock>, cooldown: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            queue,
            clock,
            cooldown: chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::MAX),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AuditRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `name` as failed verification with `message`.
    ///
    /// No-op when the record has been deleted meanwhile.
    pub fn set_failure(&self, name: &str, message: &str) {
        let now = self.clock.now();
        let mut records = self.lock();
        let Some(existing) = records.get_mut(name) else {
            return;
        };
        existing.observed_at = now;
        existing.failure = Some(AuditFailure {
            reason: REASON_VERIFICATION_FAILED.to_owned(),
            message: message.to_owned(),
        });
    }

    /// Independent copy of the record for `name`.
    pub fn get(&self, name: &str) -> Option<AuditRecord> {
        self.lock().get(name).cloned()
    }

    /// Copies of every record, sorted by tag name.
    pub fn records(&self) -> Vec<AuditRecord> {
        let mut records: Vec<AuditRecord> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Number of tracked records.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no records are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reconcile tracked records with the current tags of `release`.
    ///
    /// Only stable-channel releases are audited. New auditable tags are
    /// tracked and queued; tracked tags are queued when their digest or
    /// location drifted or when the failure cooldown elapsed (which also
    /// clears the failure). Records owned by this release whose tag is gone
    /// are dropped. Drift alone never clears a failure.
    pub fn sync(&self, release: &Release) {
        if release.config.as_mode != PublishMode::Stable {
            return;
        }

        let now = self.clock.now();
        let target = &release.target;
        let mut found: HashSet<&str> = HashSet::new();
        let mut changed_tags: Vec<String> = Vec::new();

        {
            let mut records = self.lock();

            for tag in &target.tags {
                if !tag.has_source() || tag.name.is_empty() {
                    continue;
                }
                if !tag.phase().is_some_and(|phase| phase.is_auditable()) {
                    continue;
                }
                found.insert(tag.name.as_str());

                let id = target.image_id_for_tag(&tag.name);
                let location = target.public_pull_spec(&tag.name);

                let Some(existing) = records.get_mut(&tag.name) else {
                    records.insert(
                        tag.name.clone(),
                        AuditRecord {
                            observed_at: now,
                            name: tag.name.clone(),
                            digest_id: id,
                            location,
                            release_name: release.config.name.clone(),
                            source_namespace: release.source.namespace.clone(),
                            source_name: release.source.name.clone(),
                            failure: None,
                        },
                    );
                    trace!(tag = %tag.name, "saw tag for the first time");
                    changed_tags.push(tag.name.clone());
                    continue;
                };

                let mut changed = false;
                if existing.location != location {
                    warn!(
                        tag = %tag.name,
                        from = %existing.location,
                        to = %location,
                        "location of release tag changed"
                    );
                    existing.location = location;
                    changed = true;
                }
                if existing.digest_id != id {
                    warn!(
                        tag = %tag.name,
                        from = %existing.digest_id,
                        to = %id,
                        "digest of release tag changed"
                    );
                    existing.digest_id = id;
                    changed = true;
                }
                if now.signed_duration_since(existing.observed_at) > self.cooldown {
                    existing.observed_at = now;
                    existing.failure = None;
                    changed = true;
                }
                if changed {
                    changed_tags.push(tag.name.clone());
                }
            }

            records.retain(|name, record| {
                if record.release_name != release.config.name || found.contains(name.as_str()) {
                    return true;
                }
                warn!(tag = %name, release = %record.release_name, "release tag deleted");
                false
            });
        }

        for name in &changed_tags {
            self.queue.add(name);
        }
    }
}

impl std::fmt::Debug for AuditTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTracker")
            .field("records", &self.len())
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}
