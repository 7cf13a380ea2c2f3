//! Business metrics for the hike club.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `trailhead_enrollments_total{outcome}` - enroll results (enrolled, waitlisted, conflict, rejected, failed)
//! - `trailhead_unenrollments_total` - successful unenrolls
//! - `trailhead_scans_total{outcome}` - badge scan outcomes
//! - `trailhead_capture_restarts_total{reason}` - camera pipeline restarts
//! - `trailhead_verifications_applied_total` - enrollments marked verified
//! - `trailhead_verification_apply_failures_total` - failed apply attempts
//!
//! ## Gauges
//! - `trailhead_open_verification_sessions` - sessions currently open

use metrics::{describe_counter, describe_gauge};

/// Register metric descriptions.
///
/// Call once at startup, before anything is recorded.
pub fn register_business_metrics() {
    describe_counter!(
        "trailhead_enrollments_total",
        "Enroll attempts by outcome (enrolled, waitlisted, conflict, rejected, failed)"
    );
    describe_counter!("trailhead_unenrollments_total", "Successful unenrolls");
    describe_counter!("trailhead_scans_total", "Badge scans by outcome");
    describe_counter!(
        "trailhead_capture_restarts_total",
        "Camera pipeline restarts by reason (stall, visibility, focus)"
    );
    describe_counter!(
        "trailhead_verifications_applied_total",
        "Enrollments marked verified by a successful apply"
    );
    describe_counter!(
        "trailhead_verification_apply_failures_total",
        "Apply attempts that reported an aggregate failure"
    );
    describe_gauge!(
        "trailhead_open_verification_sessions",
        "Verification sessions currently open"
    );

    tracing::info!("Business metrics registered");
}

/// Record the outcome of an enroll attempt.
pub fn record_enrollment(outcome: &'static str) {
    metrics::counter!("trailhead_enrollments_total", "outcome" => outcome).increment(1);
    tracing::debug!(outcome, "Recorded enrollment metric");
}

/// Record a successful unenroll.
pub fn record_unenrollment() {
    metrics::counter!("trailhead_unenrollments_total").increment(1);
}

/// Record a scan outcome.
pub fn record_scan(outcome: &'static str) {
    metrics::counter!("trailhead_scans_total", "outcome" => outcome).increment(1);
}

/// Record a camera pipeline restart.
pub fn record_capture_restart(reason: &'static str) {
    metrics::counter!("trailhead_capture_restarts_total", "reason" => reason).increment(1);
    tracing::debug!(reason, "Recorded capture_restart metric");
}

/// Record a verification session opening.
pub fn record_session_opened() {
    metrics::gauge!("trailhead_open_verification_sessions").increment(1.0);
}

/// Record a verification session closing, by apply or by dismissal.
pub fn record_session_closed() {
    metrics::gauge!("trailhead_open_verification_sessions").decrement(1.0);
}

/// Record a successful apply.
pub fn record_apply_succeeded(verified: usize) {
    metrics::counter!("trailhead_verifications_applied_total").increment(verified as u64);
    tracing::debug!(verified, "Recorded apply_succeeded metric");
}

/// Record a failed apply.
pub fn record_apply_failed() {
    metrics::counter!("trailhead_verification_apply_failures_total").increment(1);
}
