//! Verification reducer.
//!
//! One store holds at most one open session. Opening a new session
//! replaces the previous one; results of the old session's effects are
//! recognised by their epoch and dropped.
//!
//! **Scan pipeline** (per payload):
//! 1. blank → ignored
//! 2. not a UUID v4 → `InvalidQr`
//! 3. already listed → `AlreadyScanned`
//! 4. profile lookup → `UserNotFound`
//! 5. enrollment lookup → `AlreadyVerified`, or added as new / upgrade
//!
//! Only one scan resolves at a time; frames arriving meanwhile are
//! dropped. A repeat of the previous camera payload inside the cooldown
//! window is dropped before step 2.
//!
//! **Liveness**: a watchdog tick (`CheckLiveness`) runs for the lifetime
//! of the session and restarts the capture when no decoder callback
//! arrived within the stall window.

use super::capture::{CaptureEvent, CaptureSupervisor, Frame};
use super::session::{
    PendingScan, ScanSession, ScanSignal, ScannedParticipant, SessionCounts, SessionPhase,
    SessionSummary,
};
use super::token::{read_badge, Badge};
use crate::access::{AccessError, ActorContext};
use crate::config::VerificationConfig;
use crate::gateway::{EnrollmentRepository, GatewayError, ProfileRepository};
use crate::metrics;
use crate::policy::decide_enrollment_status;
use crate::types::{EnrollmentStatus, HikeId, Profile, RequestId, UserId};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;
use trailhead_core::{
    async_effect, delay, effect::Effect, emit, environment::Clock, reducer::Reducer, smallvec,
    SmallVec,
};

type Effects = SmallVec<[Effect<VerificationAction>; 4]>;

// ============================================================================
// Actions
// ============================================================================

/// Result of the two lookups behind a scan
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanLookup {
    /// No profile for the badge id
    NoProfile,
    /// Profile and current enrollment status
    Found {
        /// Member profile
        profile: Profile,
        /// Status on this hike, if enrolled at all
        existing: Option<EnrollmentStatus>,
    },
}

/// Why an apply request was refused before any write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyRejection {
    /// No open session
    NoSession,
    /// The list is empty
    NothingToApply,
    /// An apply is already running
    ApplyInProgress,
    /// A scan is still resolving and could change the list
    ScanInFlight,
}

/// Why a capture restart happened
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartReason {
    /// No frame within the stall window
    Stall,
    /// The page became visible again
    Visibility,
    /// The window regained focus
    Focus,
    /// A different camera was attached
    Attach,
}

impl RestartReason {
    const fn label(self) -> &'static str {
        match self {
            Self::Stall => "stall",
            Self::Visibility => "visibility",
            Self::Focus => "focus",
            Self::Attach => "attach",
        }
    }
}

/// Actions for the verification reducer
#[derive(Clone, Debug)]
pub enum VerificationAction {
    // Commands
    /// Open a session for a hike
    Open {
        /// Correlation id
        request_id: RequestId,
        /// Must be an admin
        actor: ActorContext,
        /// Hike to verify
        hike_id: HikeId,
        /// Hike capacity
        max_participants: u32,
    },

    /// A payload submitted directly rather than through the camera
    SubmitScan {
        /// Correlation id, answered by `ScanSettled`
        request_id: RequestId,
        /// Raw payload
        payload: String,
    },

    /// Switch to the list view
    ShowList,

    /// Switch back to the scanner view
    ShowScanner,

    /// The page became visible again
    VisibilityRegained,

    /// The window regained focus
    FocusRegained,

    /// A new camera was attached to the supervisor
    CaptureAttached,

    /// Commit the list
    Apply {
        /// Correlation id
        request_id: RequestId,
    },

    /// Discard the session
    Close,

    // Events
    /// Open refused
    OpenRejected {
        /// Correlation id
        request_id: RequestId,
        /// Why
        reason: AccessError,
    },

    /// Gateway counts for the session
    CountsLoaded {
        /// Correlation id of the `Open`
        request_id: RequestId,
        /// Session epoch
        epoch: u64,
        /// Counts
        counts: Result<SessionCounts, GatewayError>,
    },

    /// Something from a capture generation
    Captured {
        /// Capture generation
        generation: u64,
        /// What it reported
        event: CaptureEvent,
    },

    /// Lookups for a scan finished
    ScanResolved {
        /// Session epoch
        epoch: u64,
        /// Scanned member id
        user_id: UserId,
        /// Caller waiting, if any
        request_id: Option<RequestId>,
        /// Lookup outcome
        lookup: Result<ScanLookup, GatewayError>,
    },

    /// Answer to a `SubmitScan`
    ScanSettled {
        /// Correlation id
        request_id: RequestId,
        /// Outcome
        signal: ScanSignal,
    },

    /// Watchdog tick
    CheckLiveness {
        /// Session epoch
        epoch: u64,
    },

    /// Every entry was written
    Applied {
        /// Correlation id
        request_id: RequestId,
        /// Session epoch
        epoch: u64,
        /// Entries marked verified
        verified: usize,
        /// Counts read after the writes
        counts: Option<SessionCounts>,
    },

    /// At least one entry failed to write
    ApplyFailed {
        /// Correlation id
        request_id: RequestId,
        /// Session epoch
        epoch: u64,
        /// Entries that failed
        failed: usize,
        /// Entries attempted
        total: usize,
        /// First failure
        first_error: String,
        /// Counts read after the writes
        counts: Option<SessionCounts>,
    },

    /// Apply refused before any write
    ApplyRejected {
        /// Correlation id
        request_id: RequestId,
        /// Why
        reason: ApplyRejection,
    },
}

impl VerificationAction {
    /// Whether this action answers the command sent with `id`
    #[must_use]
    pub fn answers(&self, id: RequestId) -> bool {
        match self {
            Self::OpenRejected { request_id, .. }
            | Self::CountsLoaded { request_id, .. }
            | Self::ScanSettled { request_id, .. }
            | Self::Applied { request_id, .. }
            | Self::ApplyFailed { request_id, .. }
            | Self::ApplyRejected { request_id, .. } => *request_id == id,
            _ => false,
        }
    }
}

// ============================================================================
// State & Environment
// ============================================================================

/// Verification reducer state
#[derive(Clone, Debug, Default)]
pub struct VerificationState {
    /// Current phase
    pub phase: SessionPhase,
    /// Open session, present in `Scanning`, `Listing` and `Applying`
    pub session: Option<ScanSession>,
    last_epoch: u64,
    last_generation: u64,
}

impl VerificationState {
    /// Projection of the open session
    #[must_use]
    pub fn summary(&self, now: DateTime<Utc>, feedback_ttl: chrono::Duration) -> Option<SessionSummary> {
        self.session
            .as_ref()
            .map(|session| session.summary(self.phase, now, feedback_ttl))
    }

    fn next_epoch(&mut self) -> u64 {
        self.last_epoch += 1;
        self.last_epoch
    }

    fn next_generation(&mut self) -> u64 {
        self.last_generation += 1;
        self.last_generation
    }

    fn session_for(&mut self, epoch: u64) -> Option<&mut ScanSession> {
        self.session.as_mut().filter(|s| s.epoch == epoch)
    }
}

/// Injected collaborators
#[derive(Clone)]
pub struct VerificationEnvironment {
    /// Clock for stall detection and feedback expiry
    pub clock: Arc<dyn Clock>,
    /// Profile lookups
    pub profiles: Arc<dyn ProfileRepository>,
    /// Enrollment lookups and writes
    pub enrollments: Arc<dyn EnrollmentRepository>,
    /// Camera
    pub capture: CaptureSupervisor,
    /// Timing settings
    pub settings: VerificationConfig,
}

impl VerificationEnvironment {
    /// Creates a new `VerificationEnvironment`
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        profiles: Arc<dyn ProfileRepository>,
        enrollments: Arc<dyn EnrollmentRepository>,
        capture: CaptureSupervisor,
        settings: VerificationConfig,
    ) -> Self {
        Self {
            clock,
            profiles,
            enrollments,
            capture,
            settings,
        }
    }
}

pub(crate) fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

async fn load_counts(
    repo: Arc<dyn EnrollmentRepository>,
    hike_id: HikeId,
) -> Result<SessionCounts, GatewayError> {
    Ok(SessionCounts {
        total_enrolled: repo.count_all(hike_id).await?,
        total_verified: repo
            .count_with_status(hike_id, EnrollmentStatus::Verified)
            .await?,
        enrolled: repo
            .count_with_status(hike_id, EnrollmentStatus::Enrolled)
            .await?,
    })
}

async fn mark_verified(
    repo: &dyn EnrollmentRepository,
    hike_id: HikeId,
    user_id: UserId,
) -> Result<(), GatewayError> {
    match repo.get_enrollment(hike_id, user_id).await? {
        Some(row) => repo.update_enrollment_status(row.id, EnrollmentStatus::Verified).await,
        None => repo
            .insert_enrollment(hike_id, user_id, EnrollmentStatus::Verified)
            .await
            .map(|_| ()),
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Verification reducer
#[derive(Clone, Debug, Default)]
pub struct VerificationReducer;

impl VerificationReducer {
    /// Creates a new `VerificationReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn capture_effect(env: &VerificationEnvironment, generation: u64) -> Effect<VerificationAction> {
        Effect::Stream(Box::pin(
            env.capture
                .run(generation)
                .map(move |event| VerificationAction::Captured { generation, event }),
        ))
    }

    fn retire_effect(env: &VerificationEnvironment, generation: u64) -> Effect<VerificationAction> {
        let capture = env.capture.clone();
        async_effect! {
            capture.retire(generation);
            None
        }
    }

    fn watchdog_effect(env: &VerificationEnvironment, epoch: u64) -> Effect<VerificationAction> {
        delay! {
            duration: env.settings.watchdog_interval(),
            action: VerificationAction::CheckLiveness { epoch }
        }
    }

    /// Record a scan outcome and answer the waiting caller, if any
    fn conclude(
        session: Option<&mut ScanSession>,
        signal: ScanSignal,
        request_id: Option<RequestId>,
        now: DateTime<Utc>,
    ) -> Effects {
        metrics::record_scan(signal.label());
        if let Some(session) = session {
            if signal.is_visible() {
                session.last_signal = Some((signal.clone(), now));
            }
        }
        match request_id {
            Some(request_id) => smallvec![emit!(VerificationAction::ScanSettled { request_id, signal })],
            None => SmallVec::new(),
        }
    }

    /// Steps 2-5 of the scan pipeline for a trimmed, non-blank payload
    fn scan(
        state: &mut VerificationState,
        env: &VerificationEnvironment,
        payload: &str,
        request_id: Option<RequestId>,
    ) -> Effects {
        let now = env.clock.now();
        let Some(session) = state.session.as_mut() else {
            return Self::conclude(None, ScanSignal::NotScanning, request_id, now);
        };

        if session.in_flight.is_some() {
            tracing::debug!("Scan dropped: previous scan still resolving");
            return Self::conclude(None, ScanSignal::Busy, request_id, now);
        }

        let user_id = match read_badge(payload) {
            Badge::Blank => return Self::conclude(None, ScanSignal::Ignored, request_id, now),
            Badge::Invalid => {
                tracing::debug!(payload, "Scanned payload is not a member badge");
                return Self::conclude(Some(session), ScanSignal::InvalidQr, request_id, now);
            },
            Badge::Member(user_id) => user_id,
        };

        if session.contains(user_id) {
            return Self::conclude(
                Some(session),
                ScanSignal::AlreadyScanned { user_id },
                request_id,
                now,
            );
        }

        session.in_flight = Some(PendingScan {
            user_id,
            request_id,
        });
        let epoch = session.epoch;
        let hike_id = session.hike_id;
        let profiles = Arc::clone(&env.profiles);
        let enrollments = Arc::clone(&env.enrollments);

        smallvec![async_effect! {
            let lookup = async {
                let Some(profile) = profiles.find_profile(user_id).await? else {
                    return Ok(ScanLookup::NoProfile);
                };
                let existing = enrollments
                    .get_enrollment(hike_id, user_id)
                    .await?
                    .map(|row| row.status);
                Ok(ScanLookup::Found { profile, existing })
            }
            .await;
            Some(VerificationAction::ScanResolved { epoch, user_id, request_id, lookup })
        }]
    }

    fn restart_capture(
        state: &mut VerificationState,
        env: &VerificationEnvironment,
        reason: RestartReason,
    ) -> Effects {
        if state.phase != SessionPhase::Scanning {
            return SmallVec::new();
        }
        let generation = state.next_generation();
        let Some(session) = state.session.as_mut() else {
            return SmallVec::new();
        };
        session.capture_generation = generation;
        session.last_frame_at = env.clock.now();
        session.restarts += 1;
        metrics::record_capture_restart(reason.label());
        match reason {
            RestartReason::Stall => {
                tracing::warn!(hike_id = %session.hike_id, generation, "Capture stalled, restarting");
            },
            _ => tracing::info!(hike_id = %session.hike_id, generation, ?reason, "Restarting capture"),
        }
        smallvec![Self::capture_effect(env, generation)]
    }

    fn end_session(state: &mut VerificationState, env: &VerificationEnvironment) -> Effects {
        state.phase = SessionPhase::Closed;
        if state.session.take().is_none() {
            return SmallVec::new();
        }
        metrics::record_session_closed();
        let generation = state.next_generation();
        smallvec![Self::retire_effect(env, generation)]
    }

    fn resolve_scan(
        state: &mut VerificationState,
        env: &VerificationEnvironment,
        epoch: u64,
        user_id: UserId,
        request_id: Option<RequestId>,
        lookup: Result<ScanLookup, GatewayError>,
    ) -> Effects {
        let now = env.clock.now();
        let Some(session) = state.session_for(epoch) else {
            tracing::debug!(%user_id, "Scan resolved after its session ended");
            return Self::conclude(None, ScanSignal::NotScanning, request_id, now);
        };
        session.in_flight = None;

        let (profile, existing) = match lookup {
            Err(error) => {
                tracing::warn!(%user_id, %error, "Scan lookup failed");
                let signal = ScanSignal::LookupFailed {
                    message: error.to_string(),
                };
                return Self::conclude(Some(session), signal, request_id, now);
            },
            Ok(ScanLookup::NoProfile) => {
                return Self::conclude(Some(session), ScanSignal::UserNotFound { user_id }, request_id, now);
            },
            Ok(ScanLookup::Found { profile, existing }) => (profile, existing),
        };

        let name = profile.display_name().to_string();
        if existing == Some(EnrollmentStatus::Verified) {
            let signal = ScanSignal::AlreadyVerified { user_id, name };
            return Self::conclude(Some(session), signal, request_id, now);
        }
        if session.contains(user_id) {
            return Self::conclude(Some(session), ScanSignal::AlreadyScanned { user_id }, request_id, now);
        }

        let capacity_status = if existing.is_none() {
            let enrolled = session.counts.map_or(0, |c| c.enrolled);
            Some(decide_enrollment_status(
                enrolled + session.newly_enrolled() as u64,
                session.max_participants,
            ))
        } else {
            None
        };
        session.entries.push(ScannedParticipant {
            profile,
            scanned_at: now,
            prior_status: existing,
            capacity_status,
        });
        tracing::info!(
            hike_id = %session.hike_id,
            %user_id,
            was_enrolled = existing.is_some(),
            listed = session.entries.len(),
            "Member scanned"
        );

        let signal = ScanSignal::Added {
            user_id,
            name,
            was_enrolled: existing.is_some(),
        };
        Self::conclude(Some(session), signal, request_id, now)
    }

    fn start_apply(
        state: &mut VerificationState,
        env: &VerificationEnvironment,
        request_id: RequestId,
    ) -> Effects {
        let reject = |reason| smallvec![emit!(VerificationAction::ApplyRejected { request_id, reason })];

        let phase = state.phase;
        let Some(session) = state.session.as_mut() else {
            return reject(ApplyRejection::NoSession);
        };
        if phase == SessionPhase::Applying {
            return reject(ApplyRejection::ApplyInProgress);
        }
        if session.in_flight.is_some() {
            return reject(ApplyRejection::ScanInFlight);
        }
        if session.entries.is_empty() {
            return reject(ApplyRejection::NothingToApply);
        }

        session.resume_phase = phase;
        state.phase = SessionPhase::Applying;

        let epoch = session.epoch;
        let hike_id = session.hike_id;
        let members: Vec<UserId> = session.entries.iter().map(|e| e.profile.user_id).collect();
        let repo = Arc::clone(&env.enrollments);
        tracing::info!(%hike_id, entries = members.len(), "Applying verification");

        smallvec![async_effect! {
            let total = members.len();
            let mut failures = Vec::new();
            for user_id in members {
                if let Err(error) = mark_verified(repo.as_ref(), hike_id, user_id).await {
                    failures.push((user_id, error));
                }
            }
            let counts = load_counts(Arc::clone(&repo), hike_id).await.ok();

            Some(match failures.first() {
                None => VerificationAction::Applied {
                    request_id,
                    epoch,
                    verified: total,
                    counts,
                },
                Some((user_id, error)) => VerificationAction::ApplyFailed {
                    request_id,
                    epoch,
                    failed: failures.len(),
                    total,
                    first_error: format!("{user_id}: {error}"),
                    counts,
                },
            })
        }]
    }
}

impl Reducer for VerificationReducer {
    type State = VerificationState;
    type Action = VerificationAction;
    type Environment = VerificationEnvironment;

    #[allow(clippy::too_many_lines)]
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            // ========== Commands ==========
            VerificationAction::Open {
                request_id,
                actor,
                hike_id,
                max_participants,
            } => {
                let admin = match actor.require_admin() {
                    Ok(admin) => admin,
                    Err(reason) => {
                        return smallvec![emit!(VerificationAction::OpenRejected { request_id, reason })];
                    },
                };
                if let Some(previous) = state.session.take() {
                    tracing::warn!(hike_id = %previous.hike_id, "Replacing an open verification session");
                    metrics::record_session_closed();
                }

                let epoch = state.next_epoch();
                let generation = state.next_generation();
                state.session = Some(ScanSession::new(
                    epoch,
                    hike_id,
                    max_participants,
                    admin,
                    env.clock.now(),
                    generation,
                ));
                state.phase = SessionPhase::Scanning;
                metrics::record_session_opened();
                tracing::info!(%hike_id, %admin, epoch, "Verification session opened");

                let repo = Arc::clone(&env.enrollments);
                smallvec![
                    async_effect! {
                        let counts = load_counts(repo, hike_id).await;
                        Some(VerificationAction::CountsLoaded { request_id, epoch, counts })
                    },
                    Self::capture_effect(env, generation),
                    Self::watchdog_effect(env, epoch),
                ]
            },

            VerificationAction::SubmitScan {
                request_id,
                payload,
            } => {
                if state.phase != SessionPhase::Scanning {
                    return Self::conclude(None, ScanSignal::NotScanning, Some(request_id), env.clock.now());
                }
                Self::scan(state, env, payload.trim(), Some(request_id))
            },

            VerificationAction::ShowList => {
                if state.phase != SessionPhase::Scanning {
                    return SmallVec::new();
                }
                let generation = state.next_generation();
                let Some(session) = state.session.as_mut() else {
                    return SmallVec::new();
                };
                session.capture_generation = generation;
                state.phase = SessionPhase::Listing;
                smallvec![Self::retire_effect(env, generation)]
            },

            VerificationAction::ShowScanner => {
                if state.phase != SessionPhase::Listing {
                    return SmallVec::new();
                }
                let generation = state.next_generation();
                let Some(session) = state.session.as_mut() else {
                    return SmallVec::new();
                };
                session.capture_generation = generation;
                session.last_frame_at = env.clock.now();
                state.phase = SessionPhase::Scanning;
                smallvec![Self::capture_effect(env, generation)]
            },

            VerificationAction::VisibilityRegained => {
                Self::restart_capture(state, env, RestartReason::Visibility)
            },

            VerificationAction::FocusRegained => Self::restart_capture(state, env, RestartReason::Focus),

            VerificationAction::CaptureAttached => Self::restart_capture(state, env, RestartReason::Attach),

            VerificationAction::Apply { request_id } => Self::start_apply(state, env, request_id),

            VerificationAction::Close => {
                if state.session.is_some() {
                    tracing::info!("Verification session closed without applying");
                }
                Self::end_session(state, env)
            },

            // ========== Events ==========
            VerificationAction::OpenRejected { reason, .. } => {
                tracing::warn!(%reason, "Verification session refused");
                SmallVec::new()
            },

            VerificationAction::CountsLoaded { epoch, counts, .. } => {
                if let Some(session) = state.session_for(epoch) {
                    match counts {
                        Ok(counts) => session.counts = Some(counts),
                        Err(error) => {
                            tracing::warn!(hike_id = %session.hike_id, %error, "Could not load verification counts");
                        },
                    }
                }
                SmallVec::new()
            },

            VerificationAction::Captured { generation, event } => {
                let now = env.clock.now();
                let phase = state.phase;
                let Some(session) = state
                    .session
                    .as_mut()
                    .filter(|s| s.capture_generation == generation)
                else {
                    return SmallVec::new();
                };
                session.last_frame_at = now;

                let raw = match event {
                    CaptureEvent::Failed(error) => {
                        let signal = ScanSignal::CameraUnavailable {
                            message: error.to_string(),
                        };
                        return Self::conclude(Some(session), signal, None, now);
                    },
                    CaptureEvent::Frame(Frame::Empty) => return SmallVec::new(),
                    CaptureEvent::Frame(Frame::Decoded(raw)) => raw,
                };
                if phase != SessionPhase::Scanning {
                    return SmallVec::new();
                }
                let payload = raw.trim();
                if payload.is_empty() {
                    return SmallVec::new();
                }

                // A frame dropped as busy was never evaluated and must not arm the cooldown.
                if session.in_flight.is_some() {
                    tracing::debug!("Frame dropped: previous scan still resolving");
                    return Self::conclude(None, ScanSignal::Busy, None, now);
                }

                let cooldown = millis(env.settings.scan_cooldown_ms);
                if let Some((last, at)) = &session.last_payload {
                    if last == payload && now - *at < cooldown {
                        return SmallVec::new();
                    }
                }
                session.last_payload = Some((payload.to_string(), now));
                Self::scan(state, env, payload, None)
            },

            VerificationAction::ScanResolved {
                epoch,
                user_id,
                request_id,
                lookup,
            } => Self::resolve_scan(state, env, epoch, user_id, request_id, lookup),

            VerificationAction::CheckLiveness { epoch } => {
                let now = env.clock.now();
                let stall_window = millis(env.settings.stall_window_ms);
                let phase = state.phase;
                let Some(session) = state.session_for(epoch) else {
                    return SmallVec::new();
                };
                let stalled = phase == SessionPhase::Scanning && now - session.last_frame_at >= stall_window;

                let mut effects = if stalled {
                    Self::restart_capture(state, env, RestartReason::Stall)
                } else {
                    SmallVec::new()
                };
                effects.push(Self::watchdog_effect(env, epoch));
                effects
            },

            VerificationAction::Applied {
                epoch,
                verified,
                ..
            } => {
                metrics::record_apply_succeeded(verified);
                if state.session_for(epoch).is_none() {
                    tracing::info!(verified, "Apply finished after its session ended");
                    return SmallVec::new();
                }
                tracing::info!(verified, "Verification applied, session closed");
                Self::end_session(state, env)
            },

            VerificationAction::ApplyFailed {
                epoch,
                failed,
                total,
                first_error,
                counts,
                ..
            } => {
                metrics::record_apply_failed();
                tracing::error!(failed, total, %first_error, "Failed to apply verify badges");
                if let Some(session) = state.session_for(epoch) {
                    let resume = session.resume_phase;
                    if counts.is_some() {
                        session.counts = counts;
                    }
                    state.phase = resume;
                }
                SmallVec::new()
            },

            VerificationAction::ScanSettled { .. } | VerificationAction::ApplyRejected { .. } => {
                SmallVec::new()
            },
        }
    }
}
