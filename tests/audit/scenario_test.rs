//! End-to-end audit scenarios across tracker, verifier, signer and store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use release_auditor::exec::CommandRunner;
use release_auditor::jobs::JobControlPlane;
use release_auditor::queue::{run_workers, DelayingQueue, WorkQueue};
use release_auditor::reconcile::{Reconciler, ReconcilerDeps, SyncOutcome, DEFAULT_STORE_TIMEOUT};
use release_auditor::release::{InMemoryReleases, Release, ReleaseSource};
use release_auditor::signing::{SignatureStore, Signer};
use release_auditor::throttle::JobAdmissionThrottle;
use release_auditor::tracker::AuditTracker;
use release_auditor::verify::{JobVerifier, LocalVerifier};

use crate::fakes::{
    digest, release, running_job, FakeJobs, FakeRunner, FakeSigner, FakeStore, Harness,
    HarnessOptions, REQUEUE,
};

const TAG: &str = "4.10.0-0.ci-2023-01-01-000000";

fn scenario_digest() -> String {
    format!("sha256:{}", "abcd".repeat(16))
}

fn scenario_location() -> String {
    format!("registry.example/repo@{}", scenario_digest())
}

/// Stable release publishing [`TAG`] from `registry.example/repo`.
fn scenario_release() -> Release {
    let mut rel = release(&[(TAG, &scenario_digest())]);
    rel.target.public_docker_image_repository = "registry.example/repo".to_owned();
    rel
}

#[tokio::test]
async fn local_verification_signs_and_uploads_once() {
    let h = Harness::new();
    h.publish(scenario_release());
    assert_eq!(
        h.tracker.get(TAG).expect("record").location,
        scenario_location()
    );

    let outcome = h.reconciler.sync_tag(TAG).await.expect("sync should succeed");
    assert_eq!(outcome, SyncOutcome::Signed);
    assert_eq!(h.runner.calls().len(), 1);
    assert_eq!(h.signer.signed(), vec![(scenario_digest(), scenario_location())]);
    assert_eq!(h.store.puts(), 1);
    assert!(h.store.signature(&scenario_digest()).is_some());
    assert!(h.jobs.created().is_empty());
}

#[tokio::test]
async fn saturated_job_backend_requeues_without_side_effects() {
    let h = Harness::with_options(HarnessOptions {
        pinned_image: Some("quay.io/example/cli:4.10".to_owned()),
        ..HarnessOptions::default()
    });
    for n in 0..3 {
        h.jobs.insert(running_job(&format!("verify-busy-{n}")));
    }
    h.publish(scenario_release());

    let outcome = h.reconciler.sync_tag(TAG).await.expect("sync should succeed");
    assert_eq!(outcome, SyncOutcome::Requeued(Duration::from_secs(10)));
    assert!(h.jobs.created().is_empty());
    assert!(h.tracker.get(TAG).expect("record").failure.is_none());
    assert_eq!(h.queue.delayed(), vec![(TAG.to_owned(), Duration::from_secs(10))]);
    assert_eq!(h.signer.calls(), 0);
}

#[tokio::test]
async fn worker_pool_signs_every_published_tag() {
    let queue = DelayingQueue::new();
    let work: Arc<dyn WorkQueue> = Arc::new(queue.clone());
    let tracker = Arc::new(AuditTracker::new(Arc::clone(&work)));
    let releases = Arc::new(InMemoryReleases::new());
    let signer = Arc::new(FakeSigner::default());
    let store = Arc::new(FakeStore::default());
    let jobs: Arc<dyn JobControlPlane> = Arc::new(FakeJobs::default());
    let runner: Arc<dyn CommandRunner> = Arc::new(FakeRunner::exiting(0, "ok"));

    let reconciler = Arc::new(Reconciler::new(ReconcilerDeps {
        tracker: Arc::clone(&tracker),
        queue: work,
        releases: Arc::clone(&releases) as Arc<dyn ReleaseSource>,
        store: Arc::clone(&store) as Arc<dyn SignatureStore>,
        signer: Some(Arc::clone(&signer) as Arc<dyn Signer>),
        local: LocalVerifier::new(runner, "oc", Duration::from_secs(60)),
        jobs: JobVerifier::new(
            Arc::clone(&jobs),
            JobAdmissionThrottle::new(Arc::clone(&jobs), 2),
            REQUEUE,
        ),
        pinned_image: Some("local".to_owned()),
        store_timeout: DEFAULT_STORE_TIMEOUT,
    }));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = run_workers(queue, 2, Arc::clone(&reconciler), shutdown_rx);

    let rel = release(&[("4.1.0", &digest(1)), ("4.1.1", &digest(2)), ("4.1.2", &digest(3))]);
    assert!(releases.upsert(rel.clone()));
    reconciler
        .sync_release_description(&rel)
        .expect("sync should succeed");

    for _ in 0..200 {
        if store.puts() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.puts(), 3);
    assert_eq!(signer.calls(), 3);

    reconciler
        .sync_release_description(&rel)
        .expect("resync should succeed");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(signer.calls(), 3, "unchanged tags are not re-signed");

    shutdown_tx.send(true).expect("workers should be listening");
    for handle in handles {
        handle.await.expect("worker should exit cleanly");
    }
}
