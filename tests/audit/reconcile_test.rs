//! Tests for `src/reconcile.rs`: the per-tag state machine.

use std::sync::atomic::Ordering;
use std::time::Duration;

use release_auditor::reconcile::{ReconcileError, SyncOutcome};

use crate::fakes::{digest, panicking_reconciler, release, FakeRunner, Harness, HarnessOptions};

#[tokio::test]
async fn missing_record_is_a_no_op() {
    let h = Harness::new();
    let outcome = h.reconciler.sync_tag("ghost").await.expect("sync should succeed");
    assert_eq!(outcome, SyncOutcome::Missing);
    assert_eq!(h.signer.calls(), 0);
    assert_eq!(h.store.has_calls(), 0);
}

#[tokio::test]
async fn verified_release_is_signed_at_most_once() {
    let h = Harness::new();
    let d1 = digest(1);
    h.publish(release(&[("4.1.0", &d1)]));

    let first = h.reconciler.sync_tag("4.1.0").await.expect("sync should succeed");
    assert_eq!(first, SyncOutcome::Signed);

    for _ in 0..5 {
        let again = h.reconciler.sync_tag("4.1.0").await.expect("sync should succeed");
        assert_eq!(again, SyncOutcome::AlreadySigned);
    }

    assert_eq!(h.signer.calls(), 1);
    assert_eq!(h.store.puts(), 1);
    assert_eq!(h.runner.calls().len(), 1, "signed digests are not re-verified");
    assert_eq!(
        h.store.signature(&d1),
        Some(format!("signed {d1}").into_bytes())
    );
}

#[tokio::test]
async fn failed_record_is_skipped_without_external_calls() {
    let h = Harness::new();
    h.publish(release(&[("4.1.0", &digest(1))]));
    h.tracker.set_failure("4.1.0", "earlier failure");

    let outcome = h.reconciler.sync_tag("4.1.0").await.expect("sync should succeed");
    assert_eq!(outcome, SyncOutcome::AlreadyFailed);
    assert_eq!(h.store.has_calls(), 0);
    assert!(h.runner.calls().is_empty());
    assert_eq!(h.signer.calls(), 0);
}

#[tokio::test]
async fn failed_record_is_reverified_only_after_cooldown() {
    let h = Harness::with_options(HarnessOptions {
        runner: FakeRunner::exiting(1, "signature mismatch"),
        ..HarnessOptions::default()
    });
    let rel = release(&[("4.1.0", &digest(1))]);
    h.publish(rel.clone());

    let first = h.reconciler.sync_tag("4.1.0").await.expect("sync should succeed");
    assert_eq!(first, SyncOutcome::VerificationFailed);
    assert_eq!(h.runner.calls().len(), 1);

    h.clock.advance(chrono::Duration::minutes(11 * 60 + 59));
    h.publish(rel.clone());
    let gated = h.reconciler.sync_tag("4.1.0").await.expect("sync should succeed");
    assert_eq!(gated, SyncOutcome::AlreadyFailed);
    assert_eq!(h.runner.calls().len(), 1, "no verification while the failure is sticky");
    assert_eq!(h.jobs.calls(), 0);

    h.clock.advance(chrono::Duration::minutes(2));
    h.publish(rel);
    let retried = h.reconciler.sync_tag("4.1.0").await.expect("sync should succeed");
    assert_eq!(retried, SyncOutcome::VerificationFailed);
    assert_eq!(h.runner.calls().len(), 2, "verification runs again past the cooldown");
    assert_eq!(h.signer.calls(), 0);
}

#[tokio::test]
async fn record_without_digest_fails_immediately() {
    let h = Harness::new();
    h.publish(release(&[("4.1.0", "")]));

    let outcome = h.reconciler.sync_tag("4.1.0").await.expect("sync should succeed");
    assert_eq!(outcome, SyncOutcome::NoDigest);

    let failure = h
        .tracker
        .get("4.1.0")
        .and_then(|record| record.failure)
        .expect("failure should be recorded");
    assert_eq!(
        failure.message,
        "Release 4.1.0 has no digest and cannot be verified"
    );
    assert_eq!(h.store.has_calls(), 0);
    assert!(h.runner.calls().is_empty());
    assert_eq!(h.jobs.calls(), 0);
    assert_eq!(h.signer.calls(), 0);
}

#[tokio::test]
async fn vanished_release_stops_processing() {
    let h = Harness::new();
    h.publish(release(&[("4.1.0", &digest(1))]));
    h.releases.remove("ocp", "release");

    let outcome = h.reconciler.sync_tag("4.1.0").await.expect("sync should succeed");
    assert_eq!(outcome, SyncOutcome::ReleaseGone);
    assert_eq!(h.store.has_calls(), 0);
    assert!(h.tracker.get("4.1.0").expect("record").failure.is_none());
}

#[tokio::test]
async fn local_verification_failure_is_recorded() {
    let h = Harness::with_options(HarnessOptions {
        runner: FakeRunner::exiting(1, "error: signature mismatch\n"),
        ..HarnessOptions::default()
    });
    let d1 = digest(1);
    h.publish(release(&[("4.1.0", &d1)]));

    let outcome = h.reconciler.sync_tag("4.1.0").await.expect("sync should succeed");
    assert_eq!(outcome, SyncOutcome::VerificationFailed);

    let failure = h
        .tracker
        .get("4.1.0")
        .and_then(|record| record.failure)
        .expect("failure should be recorded");
    assert_eq!(
        failure.message,
        "Unable to verify release:\nerror: signature mismatch"
    );
    assert_eq!(h.signer.calls(), 0);

    let calls = h.runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "oc");
    assert_eq!(
        calls[0].1,
        vec![
            "adm".to_owned(),
            "release".to_owned(),
            "info".to_owned(),
            "--verify".to_owned(),
            format!("quay.io/example/release@{d1}"),
        ]
    );
}

#[tokio::test]
async fn missing_cli_image_leaves_record_pending() {
    let h = Harness::with_options(HarnessOptions {
        pinned_image: None,
        ..HarnessOptions::default()
    });
    h.publish(release(&[("4.1.0", &digest(1))]));

    let outcome = h.reconciler.sync_tag("4.1.0").await.expect("sync should succeed");
    assert_eq!(outcome, SyncOutcome::NoVerifier);
    assert!(h.tracker.get("4.1.0").expect("record").failure.is_none());
    assert!(h.runner.calls().is_empty());
    assert_eq!(h.jobs.calls(), 0);
}

#[tokio::test]
async fn release_override_image_selects_job_backend() {
    let h = Harness::with_options(HarnessOptions {
        pinned_image: None,
        ..HarnessOptions::default()
    });
    let mut rel = release(&[("4.1.0", &digest(1))]);
    rel.config.override_cli_image = Some("quay.io/example/cli:4.1".to_owned());
    h.publish(rel);

    let outcome = h.reconciler.sync_tag("4.1.0").await.expect("sync should succeed");
    assert_eq!(outcome, SyncOutcome::Requeued(Duration::from_secs(10)));
    let created = h.jobs.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].image, "quay.io/example/cli:4.1");
}

#[tokio::test]
async fn audit_only_mode_verifies_without_signing() {
    let h = Harness::with_options(HarnessOptions {
        signing: false,
        ..HarnessOptions::default()
    });
    h.publish(release(&[("4.1.0", &digest(1))]));

    let outcome = h.reconciler.sync_tag("4.1.0").await.expect("sync should succeed");
    assert_eq!(outcome, SyncOutcome::Verified);
    assert_eq!(h.store.puts(), 0);
    assert!(h.tracker.get("4.1.0").expect("record").failure.is_none());
}

#[tokio::test]
async fn signer_error_propagates_without_recording_failure() {
    let h = Harness::new();
    h.signer.fail.store(true, Ordering::SeqCst);
    h.publish(release(&[("4.1.0", &digest(1))]));

    let err = h
        .reconciler
        .sync_tag("4.1.0")
        .await
        .expect_err("signing should fail");
    assert!(matches!(err, ReconcileError::Sign(_)));
    assert!(err.to_string().starts_with("unable to sign release"));
    assert!(h.tracker.get("4.1.0").expect("record").failure.is_none());
    assert_eq!(h.store.puts(), 0);

    h.signer.fail.store(false, Ordering::SeqCst);
    let retried = h.reconciler.sync_tag("4.1.0").await.expect("retry should succeed");
    assert_eq!(retried, SyncOutcome::Signed);
}

#[tokio::test]
async fn store_error_propagates_without_recording_failure() {
    let h = Harness::new();
    h.store.fail.store(true, Ordering::SeqCst);
    h.publish(release(&[("4.1.0", &digest(1))]));

    let err = h
        .reconciler
        .sync_tag("4.1.0")
        .await
        .expect_err("upload should fail");
    assert!(matches!(err, ReconcileError::Store(_)));
    assert!(err
        .to_string()
        .starts_with("unable to upload release signature"));
    assert!(h.tracker.get("4.1.0").expect("record").failure.is_none());
}

#[tokio::test(start_paused = true)]
async fn slow_store_times_out() {
    let h = Harness::with_options(HarnessOptions {
        store_timeout: Duration::from_secs(30),
        ..HarnessOptions::default()
    });
    *h.store.put_delay.lock().expect("delay lock") = Some(Duration::from_secs(31));
    h.publish(release(&[("4.1.0", &digest(1))]));

    let err = h
        .reconciler
        .sync_tag("4.1.0")
        .await
        .expect_err("upload should time out");
    assert!(matches!(err, ReconcileError::StoreTimeout { seconds: 30 }));
    assert!(h.tracker.get("4.1.0").expect("record").failure.is_none());
    assert!(h.store.signature(&digest(1)).is_none());
}

#[tokio::test]
async fn sync_release_loads_from_source() {
    let h = Harness::new();
    assert!(h.releases.upsert(release(&[("4.1.0", &digest(1))])));

    h.reconciler
        .sync_release("ocp", "release")
        .await
        .expect("sync should succeed");
    assert!(h.tracker.get("4.1.0").is_some());
    assert_eq!(h.queue.added(), vec!["4.1.0".to_owned()]);

    h.reconciler
        .sync_release("ocp", "missing")
        .await
        .expect("missing release is not an error");
}

#[test]
fn panic_during_release_sync_is_reported() {
    let reconciler = panicking_reconciler();
    let err = reconciler
        .sync_release_description(&release(&[("4.1.0", &digest(1))]))
        .expect_err("panic should be converted");
    match err {
        ReconcileError::Panicked { release, message } => {
            assert_eq!(release, "4-stable");
            assert!(message.contains("queue exploded"));
        }
        other => panic!("unexpected error: {other}"),
    }
}
