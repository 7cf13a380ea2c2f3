//! End-to-end tests for the attendance verification workflow
//!
//! Drives the workflow through both entry points (the manual camera and
//! direct `on_scan` calls) against the in-memory store. The store's clock
//! is a `ManualClock`, so cooldown, feedback expiry and stall detection are
//! controlled by the test; the watchdog itself ticks on real time.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use trailhead_club::access::load_actor;
use trailhead_club::config::VerificationConfig;
use trailhead_club::verification::{
    CaptureSupervisor, ManualCamera, ScanSignal, SessionPhase, SessionSummary,
};
use trailhead_club::{
    ActorContext, EnrollmentStatus, HikeId, InMemoryClubStore, Profile, Role, UserId,
    VerificationEnvironment, VerificationError, VerificationWorkflow,
};
use trailhead_testing::{init_test_tracing, manual_test_clock, ManualClock};

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

struct Harness {
    store: InMemoryClubStore,
    camera: ManualCamera,
    clock: ManualClock,
    workflow: VerificationWorkflow,
    admin: ActorContext,
    hike_id: HikeId,
}

fn settings() -> VerificationConfig {
    VerificationConfig {
        watchdog_interval_ms: 20,
        request_timeout_ms: 2_000,
        ..VerificationConfig::default()
    }
}

fn harness() -> Harness {
    init_test_tracing();
    let store = InMemoryClubStore::new();
    let camera = ManualCamera::new();
    let clock = manual_test_clock();
    let workflow = VerificationWorkflow::new(VerificationEnvironment::new(
        Arc::new(clock.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        CaptureSupervisor::new(Arc::new(camera.clone())),
        settings(),
    ));
    let admin_id = UserId::new();
    store.grant(admin_id, Role::Admin);
    Harness {
        store,
        camera,
        clock,
        workflow,
        admin: ActorContext::admin(admin_id),
        hike_id: HikeId::new(),
    }
}

impl Harness {
    fn member(&self, name: &str) -> UserId {
        let user_id = UserId::new();
        self.store.add_profile(Profile {
            user_id,
            full_name: Some(name.to_string()),
            email: None,
            avatar_url: None,
        });
        user_id
    }

    async fn open(&self, max_participants: u32) -> SessionSummary {
        self.workflow
            .open(&self.admin, self.hike_id, max_participants)
            .await
            .unwrap()
    }

    async fn wait_for_camera(&self, starts: usize) {
        eventually("camera to start", || {
            self.camera.starts() >= starts && self.camera.is_listening()
        })
        .await;
    }

    async fn wait_for_summary(&self, check: impl Fn(&SessionSummary) -> bool) -> SessionSummary {
        for _ in 0..200 {
            if let Some(summary) = self.workflow.summary().await {
                if check(&summary) {
                    return summary;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("summary never matched; last: {:?}", self.workflow.summary().await);
    }
}

// ============================================================================
// Access
// ============================================================================

#[tokio::test]
async fn only_admins_open_sessions() {
    let h = harness();
    let member = ActorContext::member(h.member("Robin"));

    assert_eq!(
        h.workflow.open(&member, h.hike_id, 5).await,
        Err(VerificationError::Forbidden)
    );
    assert_eq!(
        h.workflow.open(&ActorContext::anonymous(), h.hike_id, 5).await,
        Err(VerificationError::NotAuthenticated)
    );
    assert!(h.workflow.summary().await.is_none());
    assert_eq!(h.camera.starts(), 0);
}

#[tokio::test]
async fn actor_loaded_from_roles_can_open() {
    let h = harness();
    let actor = load_actor(&h.store, h.admin.user_id).await.unwrap();

    let summary = h.workflow.open(&actor, h.hike_id, 5).await.unwrap();
    assert_eq!(summary.phase, SessionPhase::Scanning);
    assert!(summary.counts_loaded);
}

#[tokio::test]
async fn open_survives_count_failure() {
    let h = harness();
    h.store.set_unavailable(true);

    let summary = h.open(5).await;
    assert!(!summary.counts_loaded);
    assert_eq!(summary.total_enrolled, 0);
}

// ============================================================================
// Scanning
// ============================================================================

#[tokio::test]
async fn scan_outcomes_through_on_scan() {
    let h = harness();
    let enrolled = h.member("Avery");
    let verified = h.member("Blake");
    let walk_in = h.member("Cody");
    h.store.seed_enrollment(h.hike_id, enrolled, EnrollmentStatus::Enrolled);
    h.store.seed_enrollment(h.hike_id, verified, EnrollmentStatus::Verified);
    h.open(10).await;

    assert_eq!(h.workflow.on_scan("not a badge").await.unwrap(), ScanSignal::InvalidQr);
    assert_eq!(h.workflow.on_scan("   ").await.unwrap(), ScanSignal::Ignored);

    let unknown = UserId::new();
    assert_eq!(
        h.workflow.on_scan(unknown.to_string()).await.unwrap(),
        ScanSignal::UserNotFound { user_id: unknown }
    );
    assert_eq!(
        h.workflow.on_scan(verified.to_string()).await.unwrap(),
        ScanSignal::AlreadyVerified {
            user_id: verified,
            name: "Blake".to_string()
        }
    );
    assert_eq!(
        h.workflow.on_scan(format!(" {enrolled}\n")).await.unwrap(),
        ScanSignal::Added {
            user_id: enrolled,
            name: "Avery".to_string(),
            was_enrolled: true
        }
    );
    assert_eq!(
        h.workflow.on_scan(walk_in.to_string().to_uppercase()).await.unwrap(),
        ScanSignal::Added {
            user_id: walk_in,
            name: "Cody".to_string(),
            was_enrolled: false
        }
    );

    let summary = h.workflow.summary().await.unwrap();
    assert_eq!(summary.total_scanned, 2);
    assert_eq!(summary.newly_enrolled, 1);
    assert_eq!(summary.already_enrolled, 1);
    assert_eq!(h.store.write_count(), 0);
}

#[tokio::test]
async fn duplicate_scan_keeps_one_entry() {
    let h = harness();
    let member = h.member("Dana");
    h.open(10).await;

    h.workflow.on_scan(member.to_string()).await.unwrap();
    assert_eq!(
        h.workflow.on_scan(member.to_string()).await.unwrap(),
        ScanSignal::AlreadyScanned { user_id: member }
    );
    assert_eq!(h.workflow.summary().await.unwrap().total_scanned, 1);
}

#[tokio::test]
async fn lookup_failure_is_reported_and_recoverable() {
    let h = harness();
    let member = h.member("Eli");
    h.open(10).await;

    h.store.set_unavailable(true);
    let signal = h.workflow.on_scan(member.to_string()).await.unwrap();
    assert!(matches!(signal, ScanSignal::LookupFailed { .. }));

    h.store.set_unavailable(false);
    assert!(matches!(
        h.workflow.on_scan(member.to_string()).await.unwrap(),
        ScanSignal::Added { .. }
    ));
}

#[tokio::test]
async fn camera_frames_are_scanned() {
    let h = harness();
    let member = h.member("Finley");
    h.open(10).await;
    h.wait_for_camera(1).await;

    assert!(h.camera.show_text(member.to_string()));
    let summary = h.wait_for_summary(|s| s.total_scanned == 1).await;
    assert_eq!(
        summary.feedback,
        Some(ScanSignal::Added {
            user_id: member,
            name: "Finley".to_string(),
            was_enrolled: false
        })
    );
}

#[tokio::test]
async fn repeated_camera_payload_waits_for_cooldown() {
    let h = harness();
    let member = h.member("Gale");
    h.open(10).await;
    h.wait_for_camera(1).await;

    h.camera.show_text(member.to_string());
    h.wait_for_summary(|s| s.total_scanned == 1).await;

    // Same payload inside the cooldown: dropped before any lookup.
    h.camera.show_text(member.to_string());
    tokio::time::sleep(Duration::from_millis(50)).await;
    let summary = h.workflow.summary().await.unwrap();
    assert!(matches!(summary.feedback, Some(ScanSignal::Added { .. })));

    h.clock.advance(ChronoDuration::milliseconds(2_000));
    h.camera.show_text(member.to_string());
    h.wait_for_summary(|s| s.feedback == Some(ScanSignal::AlreadyScanned { user_id: member }))
        .await;
}

#[tokio::test]
async fn feedback_expires_after_ttl() {
    let h = harness();
    h.open(10).await;

    h.workflow.on_scan("https://example.org").await.unwrap();
    assert_eq!(h.workflow.summary().await.unwrap().feedback, Some(ScanSignal::InvalidQr));

    h.clock.advance(ChronoDuration::milliseconds(3_000));
    assert_eq!(h.workflow.summary().await.unwrap().feedback, None);
}

#[tokio::test]
async fn list_view_stops_scanning() {
    let h = harness();
    let member = h.member("Harper");
    h.open(10).await;
    h.wait_for_camera(1).await;

    h.workflow.show_list().await.unwrap();
    h.wait_for_summary(|s| s.phase == SessionPhase::Listing).await;
    assert_eq!(h.workflow.on_scan(member.to_string()).await.unwrap(), ScanSignal::NotScanning);

    h.workflow.show_scanner().await.unwrap();
    h.wait_for_camera(2).await;
    assert!(matches!(
        h.workflow.on_scan(member.to_string()).await.unwrap(),
        ScanSignal::Added { .. }
    ));
}

// ============================================================================
// Capture lifecycle
// ============================================================================

#[tokio::test]
async fn stalled_camera_is_restarted() {
    let h = harness();
    let member = h.member("Indy");
    h.open(10).await;
    h.wait_for_camera(1).await;

    h.camera.freeze();
    h.clock.advance(ChronoDuration::milliseconds(6_000));
    h.wait_for_camera(2).await;

    let summary = h.wait_for_summary(|s| s.capture_restarts == 1).await;
    assert_eq!(summary.phase, SessionPhase::Scanning);

    h.camera.show_text(member.to_string());
    h.wait_for_summary(|s| s.total_scanned == 1).await;
}

#[tokio::test]
async fn healthy_camera_is_left_alone() {
    let h = harness();
    h.open(10).await;
    h.wait_for_camera(1).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.camera.starts(), 1);
    assert_eq!(h.workflow.summary().await.unwrap().capture_restarts, 0);
}

#[tokio::test]
async fn refused_camera_reports_and_retries_on_focus() {
    let h = harness();
    h.camera.refuse_next_starts(1);
    h.open(10).await;

    h.wait_for_summary(|s| matches!(s.feedback, Some(ScanSignal::CameraUnavailable { .. })))
        .await;

    h.workflow.focus_regained().await.unwrap();
    h.wait_for_camera(2).await;
}

#[tokio::test]
async fn visibility_and_new_camera_restart_capture() {
    let h = harness();
    h.open(10).await;
    h.wait_for_camera(1).await;

    h.workflow.visibility_regained().await.unwrap();
    h.wait_for_camera(2).await;

    let replacement = ManualCamera::new();
    h.workflow.attach_capture(Arc::new(replacement.clone())).await.unwrap();
    eventually("replacement camera", || replacement.is_listening()).await;
    eventually("old camera to stop", || !h.camera.is_listening()).await;
    h.wait_for_summary(|s| s.capture_restarts == 2).await;
}

// ============================================================================
// Apply
// ============================================================================

#[tokio::test]
async fn apply_verifies_every_entry_and_closes() {
    let h = harness();
    let first = h.member("Jules");
    let second = h.member("Kai");
    let walk_in = h.member("Lee");
    h.store.seed_enrollment(h.hike_id, first, EnrollmentStatus::Enrolled);
    h.store.seed_enrollment(h.hike_id, second, EnrollmentStatus::Waitlisted);
    h.open(2).await;

    for id in [first, second, walk_in] {
        h.workflow.on_scan(id.to_string()).await.unwrap();
    }
    let report = h.workflow.apply().await.unwrap();
    assert_eq!(report.verified, 3);
    assert_eq!(report.total_verified, Some(3));
    assert_eq!(report.total_enrolled, Some(3));

    let rows = h.store.enrollments_of(h.hike_id);
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.status == EnrollmentStatus::Verified));
    assert!(h.workflow.summary().await.is_none());
    eventually("camera to stop", || !h.camera.is_listening()).await;
}

#[tokio::test]
async fn empty_apply_is_rejected() {
    let h = harness();
    h.open(5).await;

    assert_eq!(h.workflow.apply().await, Err(VerificationError::NothingToApply));
    assert_eq!(h.store.write_count(), 0);
    assert!(h.workflow.summary().await.is_some());
}

#[tokio::test]
async fn apply_after_close_is_rejected() {
    let h = harness();
    let member = h.member("Mika");
    h.open(5).await;
    h.workflow.on_scan(member.to_string()).await.unwrap();

    h.workflow.close().await.unwrap();
    assert_eq!(h.workflow.apply().await, Err(VerificationError::SessionClosed));
    assert_eq!(h.store.write_count(), 0);
    assert!(h.store.enrollments_of(h.hike_id).is_empty());
}

#[tokio::test]
async fn partial_failure_keeps_the_list() {
    let h = harness();
    let good = h.member("Noor");
    let bad = h.member("Oak");
    h.store.seed_enrollment(h.hike_id, good, EnrollmentStatus::Enrolled);
    h.open(5).await;
    h.workflow.on_scan(good.to_string()).await.unwrap();
    h.workflow.on_scan(bad.to_string()).await.unwrap();

    h.store.fail_writes_for(bad);
    match h.workflow.apply().await {
        Err(VerificationError::AggregateApply { failed, total, .. }) => {
            assert_eq!(failed, 1);
            assert_eq!(total, 2);
        },
        other => panic!("expected aggregate failure, got {other:?}"),
    }

    let summary = h.workflow.summary().await.unwrap();
    assert_eq!(summary.phase, SessionPhase::Scanning);
    assert_eq!(summary.total_scanned, 2);

    h.store.heal_writes_for(bad);
    assert_eq!(h.workflow.apply().await.unwrap().verified, 2);
    assert!(h
        .store
        .enrollments_of(h.hike_id)
        .iter()
        .all(|r| r.status == EnrollmentStatus::Verified));
}

#[tokio::test]
async fn reopening_replaces_the_session() {
    let h = harness();
    let member = h.member("Pat");
    h.open(5).await;
    h.workflow.on_scan(member.to_string()).await.unwrap();

    let other_hike = HikeId::new();
    let summary = h.workflow.open(&h.admin, other_hike, 5).await.unwrap();
    assert_eq!(summary.hike_id, other_hike);
    assert_eq!(summary.total_scanned, 0);
}

#[tokio::test]
async fn shutdown_stops_camera_and_watchdog() {
    let h = harness();
    h.open(5).await;
    h.wait_for_camera(1).await;

    h.workflow.shutdown(Duration::from_secs(2)).await.unwrap();
    assert!(!h.camera.is_listening());
}
