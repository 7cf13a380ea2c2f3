//! Scan session data and its read-only projection.

use crate::policy::spots_left;
use crate::types::{EnrollmentStatus, HikeId, Profile, RequestId, UserId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Workflow phase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// No session was ever opened
    #[default]
    Idle,
    /// Camera running, frames are processed
    Scanning,
    /// Showing the scanned list; frames are not processed
    Listing,
    /// Committing the list; the list is frozen
    Applying,
    /// Session discarded or applied
    Closed,
}

/// Feedback for one scan
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanSignal {
    /// Blank payload, or the previous payload again within the cooldown
    Ignored,
    /// The previous scan is still resolving
    Busy,
    /// No session in the scanner view
    NotScanning,
    /// Payload is not a member badge
    InvalidQr,
    /// Member already on this session's list
    AlreadyScanned {
        /// Member
        user_id: UserId,
    },
    /// Badge id has no profile
    UserNotFound {
        /// Scanned id
        user_id: UserId,
    },
    /// Member's enrollment is already verified
    AlreadyVerified {
        /// Member
        user_id: UserId,
        /// Display name
        name: String,
    },
    /// Member added to the list
    Added {
        /// Member
        user_id: UserId,
        /// Display name
        name: String,
        /// Whether they already had an enrollment row
        was_enrolled: bool,
    },
    /// Profile or enrollment lookup failed
    LookupFailed {
        /// Gateway message
        message: String,
    },
    /// The camera could not be started
    CameraUnavailable {
        /// Device message
        message: String,
    },
}

impl ScanSignal {
    /// Metric label
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Busy => "busy",
            Self::NotScanning => "not_scanning",
            Self::InvalidQr => "invalid_qr",
            Self::AlreadyScanned { .. } => "already_scanned",
            Self::UserNotFound { .. } => "user_not_found",
            Self::AlreadyVerified { .. } => "already_verified",
            Self::Added { was_enrolled: true, .. } => "added_upgrade",
            Self::Added { was_enrolled: false, .. } => "added_new",
            Self::LookupFailed { .. } => "lookup_failed",
            Self::CameraUnavailable { .. } => "camera_unavailable",
        }
    }

    /// Whether the admin should see this signal
    #[must_use]
    pub const fn is_visible(&self) -> bool {
        !matches!(self, Self::Ignored | Self::Busy | Self::NotScanning)
    }

    /// Text shown to the admin
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Ignored | Self::Busy | Self::NotScanning => String::new(),
            Self::InvalidQr => "Invalid QR code format".to_string(),
            Self::AlreadyScanned { .. } => "User already scanned".to_string(),
            Self::UserNotFound { .. } => "User not found in database".to_string(),
            Self::AlreadyVerified { name, .. } => format!("{name} has already been verified"),
            Self::Added {
                name,
                was_enrolled: true,
                ..
            } => format!("{name} added to verification list"),
            Self::Added {
                name,
                was_enrolled: false,
                ..
            } => format!("{name} will be enrolled and verified"),
            Self::LookupFailed { .. } => "Error verifying user".to_string(),
            Self::CameraUnavailable { .. } => "Camera access denied or unavailable".to_string(),
        }
    }
}

/// One member on the session list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedParticipant {
    /// Profile as read at scan time
    pub profile: Profile,
    /// When the badge was read
    pub scanned_at: DateTime<Utc>,
    /// Status before this session; `None` for walk-ins
    pub prior_status: Option<EnrollmentStatus>,
    /// For walk-ins, the status the capacity policy would have given them
    pub capacity_status: Option<EnrollmentStatus>,
}

impl ScannedParticipant {
    /// Whether the member already had an enrollment row
    #[must_use]
    pub const fn was_enrolled(&self) -> bool {
        self.prior_status.is_some()
    }
}

/// Counts read from the gateway
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounts {
    /// Rows of the hike, any status
    pub total_enrolled: u64,
    /// Rows with status `verified`
    pub total_verified: u64,
    /// Rows with status `enrolled`
    pub enrolled: u64,
}

/// A scan whose lookups are running
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingScan {
    /// Member being resolved
    pub user_id: UserId,
    /// Caller waiting for the outcome, if the scan was submitted directly
    pub request_id: Option<RequestId>,
}

/// Authoritative state of an open session
#[derive(Clone, Debug)]
pub struct ScanSession {
    /// Distinguishes this session from earlier ones on the same store
    pub epoch: u64,
    /// Hike under verification
    pub hike_id: HikeId,
    /// Hike capacity
    pub max_participants: u32,
    /// Admin who opened the session
    pub opened_by: UserId,
    /// Scanned members, in scan order
    pub entries: Vec<ScannedParticipant>,
    /// Gateway counts; `None` until loaded or after a failed load
    pub counts: Option<SessionCounts>,
    /// Scan currently resolving
    pub in_flight: Option<PendingScan>,
    /// Last camera payload and when it was read
    pub last_payload: Option<(String, DateTime<Utc>)>,
    /// Last decoder callback
    pub last_frame_at: DateTime<Utc>,
    /// Capture generation whose frames are accepted
    pub capture_generation: u64,
    /// Last visible signal and when it was raised
    pub last_signal: Option<(ScanSignal, DateTime<Utc>)>,
    /// Phase to return to when an apply fails
    pub resume_phase: SessionPhase,
    /// Capture restarts so far
    pub restarts: u32,
}

impl ScanSession {
    /// Fresh session, camera generation `capture_generation` starting now
    #[must_use]
    pub const fn new(
        epoch: u64,
        hike_id: HikeId,
        max_participants: u32,
        opened_by: UserId,
        now: DateTime<Utc>,
        capture_generation: u64,
    ) -> Self {
        Self {
            epoch,
            hike_id,
            max_participants,
            opened_by,
            entries: Vec::new(),
            counts: None,
            in_flight: None,
            last_payload: None,
            last_frame_at: now,
            capture_generation,
            last_signal: None,
            resume_phase: SessionPhase::Scanning,
            restarts: 0,
        }
    }

    /// Whether `user_id` is already on the list
    #[must_use]
    pub fn contains(&self, user_id: UserId) -> bool {
        self.entries.iter().any(|e| e.profile.user_id == user_id)
    }

    /// Walk-ins on the list
    #[must_use]
    pub fn newly_enrolled(&self) -> usize {
        self.entries.iter().filter(|e| !e.was_enrolled()).count()
    }

    /// Members on the list who already had a row
    #[must_use]
    pub fn already_enrolled(&self) -> usize {
        self.entries.iter().filter(|e| e.was_enrolled()).count()
    }

    /// Read-only projection for display
    #[must_use]
    pub fn summary(&self, phase: SessionPhase, now: DateTime<Utc>, feedback_ttl: Duration) -> SessionSummary {
        let counts = self.counts.unwrap_or_default();
        let newly = self.newly_enrolled() as u64;
        let scanned = self.entries.len() as u64;
        let total_enrolled = counts.total_enrolled + newly;
        let total_verified = counts.total_verified + scanned;

        SessionSummary {
            hike_id: self.hike_id,
            phase,
            entries: self.entries.clone(),
            total_scanned: self.entries.len(),
            newly_enrolled: self.newly_enrolled(),
            already_enrolled: self.already_enrolled(),
            total_enrolled,
            total_verified,
            not_verified_yet: total_enrolled.saturating_sub(total_verified),
            spots_left: spots_left(self.max_participants, counts.enrolled + newly),
            counts_loaded: self.counts.is_some(),
            feedback: self
                .last_signal
                .as_ref()
                .filter(|(_, at)| now - *at < feedback_ttl)
                .map(|(signal, _)| signal.clone()),
            capture_restarts: self.restarts,
        }
    }
}

/// What the scanner dialog shows
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Hike under verification
    pub hike_id: HikeId,
    /// Current phase
    pub phase: SessionPhase,
    /// Scanned members
    pub entries: Vec<ScannedParticipant>,
    /// Entries on the list
    pub total_scanned: usize,
    /// Walk-ins on the list
    pub newly_enrolled: usize,
    /// Listed members who already had a row
    pub already_enrolled: usize,
    /// Gateway total plus walk-ins
    pub total_enrolled: u64,
    /// Gateway verified count plus list entries
    pub total_verified: u64,
    /// Enrolled but not yet verified
    pub not_verified_yet: u64,
    /// Spots left counting walk-ins
    pub spots_left: i64,
    /// Whether the gateway counts are loaded
    pub counts_loaded: bool,
    /// Current feedback, if still fresh
    pub feedback: Option<ScanSignal>,
    /// Capture restarts so far
    pub capture_restarts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(prior_status: Option<EnrollmentStatus>) -> ScannedParticipant {
        ScannedParticipant {
            profile: Profile {
                user_id: UserId::new(),
                full_name: Some("Walker".to_string()),
                email: None,
                avatar_url: None,
            },
            scanned_at: Utc::now(),
            prior_status,
            capacity_status: None,
        }
    }

    #[test]
    fn summary_adds_list_to_gateway_counts() {
        let now = Utc::now();
        let mut session = ScanSession::new(1, HikeId::new(), 10, UserId::new(), now, 1);
        session.counts = Some(SessionCounts {
            total_enrolled: 6,
            total_verified: 1,
            enrolled: 5,
        });
        session.entries.push(participant(None));
        session.entries.push(participant(Some(EnrollmentStatus::Enrolled)));

        let summary = session.summary(SessionPhase::Scanning, now, Duration::seconds(3));
        assert_eq!(summary.total_scanned, 2);
        assert_eq!(summary.newly_enrolled, 1);
        assert_eq!(summary.already_enrolled, 1);
        assert_eq!(summary.total_enrolled, 7);
        assert_eq!(summary.total_verified, 3);
        assert_eq!(summary.not_verified_yet, 4);
        assert_eq!(summary.spots_left, 4);
        assert!(summary.counts_loaded);
    }

    #[test]
    fn feedback_expires() {
        let now = Utc::now();
        let mut session = ScanSession::new(1, HikeId::new(), 10, UserId::new(), now, 1);
        session.last_signal = Some((ScanSignal::InvalidQr, now));

        let fresh = session.summary(SessionPhase::Scanning, now + Duration::seconds(2), Duration::seconds(3));
        assert_eq!(fresh.feedback, Some(ScanSignal::InvalidQr));

        let stale = session.summary(SessionPhase::Scanning, now + Duration::seconds(3), Duration::seconds(3));
        assert_eq!(stale.feedback, None);
    }

    #[test]
    fn messages_for_added_members() {
        let user_id = UserId::new();
        let walk_in = ScanSignal::Added {
            user_id,
            name: "Ana".to_string(),
            was_enrolled: false,
        };
        assert_eq!(walk_in.message(), "Ana will be enrolled and verified");
        assert_eq!(walk_in.label(), "added_new");
        assert!(!ScanSignal::Busy.is_visible());
    }
}
