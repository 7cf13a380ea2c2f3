//! Enrollment reducer.
//!
//! Drives `enroll` and `unenroll` as a chain of gateway effects:
//!
//! ```text
//! Enroll ──► ExistingChecked ──► CountLoaded ──► Enrolled | EnrollFailed
//!                   │                 (policy decides the status here)
//!                   └──(atomic)──► insert_within_capacity ──► Enrolled | EnrollFailed
//! ```
//!
//! **Concurrency**: the default path reads the `enrolled` count and inserts
//! in two separate gateway calls, so two members racing for the last spot
//! can both be enrolled. Setting `atomic_capacity_check` moves the count
//! and the insert into one gateway call.
//!
//! Requests for the same (hike, member) pair are serialized: a second
//! request while one is in flight is refused with `InProgress`.

use crate::access::ActorContext;
use crate::gateway::{EnrollmentRepository, GatewayError, HikeRepository};
use crate::metrics;
use crate::policy::decide_enrollment_status;
use crate::types::{Enrollment, EnrollmentStatus, HikeId, RequestId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use trailhead_core::{
    async_effect, effect::Effect, emit, environment::Clock, reducer::Reducer, smallvec, SmallVec,
};

// ============================================================================
// Actions
// ============================================================================

/// Why an enroll or unenroll request did not go through
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnrollmentFailure {
    /// Anonymous visitor
    NotAuthenticated,
    /// The member already has a row for this hike
    AlreadyEnrolled(EnrollmentStatus),
    /// Another request for the same pair is still running
    InProgress,
    /// A concurrent insert created the row first
    Conflict(String),
    /// Any other gateway failure
    Gateway(GatewayError),
}

impl EnrollmentFailure {
    const fn metric_label(&self) -> &'static str {
        match self {
            Self::NotAuthenticated | Self::AlreadyEnrolled(_) | Self::InProgress => "rejected",
            Self::Conflict(_) => "conflict",
            Self::Gateway(_) => "failed",
        }
    }
}

impl From<GatewayError> for EnrollmentFailure {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::Conflict(message) => Self::Conflict(message),
            other => Self::Gateway(other),
        }
    }
}

/// Actions for the enrollment reducer
#[derive(Clone, Debug, PartialEq)]
pub enum EnrollmentAction {
    // Commands
    /// The acting member joins a hike
    Enroll {
        /// Correlation id
        request_id: RequestId,
        /// Who is joining
        actor: ActorContext,
        /// Hike to join
        hike_id: HikeId,
        /// Hike capacity
        max_participants: u32,
    },

    /// The acting member leaves a hike (or its waitlist)
    Unenroll {
        /// Correlation id
        request_id: RequestId,
        /// Who is leaving
        actor: ActorContext,
        /// Hike to leave
        hike_id: HikeId,
    },

    // Events
    /// Existing-row lookup finished
    ExistingChecked {
        /// Correlation id
        request_id: RequestId,
        /// Hike
        hike_id: HikeId,
        /// Member
        user_id: UserId,
        /// Hike capacity
        max_participants: u32,
        /// Row found, if any
        existing: Result<Option<Enrollment>, GatewayError>,
    },

    /// `enrolled` count read for the policy
    CountLoaded {
        /// Correlation id
        request_id: RequestId,
        /// Hike
        hike_id: HikeId,
        /// Member
        user_id: UserId,
        /// Hike capacity
        max_participants: u32,
        /// Current `enrolled` rows
        count: Result<u64, GatewayError>,
    },

    /// Row inserted
    Enrolled {
        /// Correlation id
        request_id: RequestId,
        /// The new row
        enrollment: Enrollment,
    },

    /// Enroll request ended without a row
    EnrollFailed {
        /// Correlation id
        request_id: RequestId,
        /// Why
        failure: EnrollmentFailure,
    },

    /// Row deleted (or was already absent)
    Unenrolled {
        /// Correlation id
        request_id: RequestId,
        /// Hike
        hike_id: HikeId,
        /// Member
        user_id: UserId,
    },

    /// Unenroll request failed
    UnenrollFailed {
        /// Correlation id
        request_id: RequestId,
        /// Why
        failure: EnrollmentFailure,
    },
}

impl EnrollmentAction {
    /// Whether this action answers the request `id`
    #[must_use]
    pub fn answers(&self, id: RequestId) -> bool {
        match self {
            Self::Enrolled { request_id, .. }
            | Self::EnrollFailed { request_id, .. }
            | Self::Unenrolled { request_id, .. }
            | Self::UnenrollFailed { request_id, .. } => *request_id == id,
            _ => false,
        }
    }
}

// ============================================================================
// State & Environment
// ============================================================================

/// Enrollment reducer state
#[derive(Clone, Debug, Default)]
pub struct EnrollmentState {
    /// Enroll requests still running, by request id
    pub in_flight: HashMap<RequestId, (HikeId, UserId)>,
}

impl EnrollmentState {
    /// Whether an enroll for the pair is already running
    #[must_use]
    pub fn is_busy(&self, hike_id: HikeId, user_id: UserId) -> bool {
        self.in_flight.values().any(|pair| *pair == (hike_id, user_id))
    }
}

/// Injected collaborators
#[derive(Clone)]
pub struct EnrollmentEnvironment {
    /// Clock for hike status derivation
    pub clock: Arc<dyn Clock>,
    /// Enrollment table
    pub enrollments: Arc<dyn EnrollmentRepository>,
    /// Hike table
    pub hikes: Arc<dyn HikeRepository>,
    /// Count and insert in one gateway call
    pub atomic_capacity_check: bool,
}

impl EnrollmentEnvironment {
    /// Creates a new `EnrollmentEnvironment` using the read-count-then-insert path
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        enrollments: Arc<dyn EnrollmentRepository>,
        hikes: Arc<dyn HikeRepository>,
    ) -> Self {
        Self {
            clock,
            enrollments,
            hikes,
            atomic_capacity_check: false,
        }
    }

    /// Switch the capacity check to the atomic gateway call
    #[must_use]
    pub const fn with_atomic_capacity_check(mut self, atomic: bool) -> Self {
        self.atomic_capacity_check = atomic;
        self
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Enrollment reducer
#[derive(Clone, Debug, Default)]
pub struct EnrollmentReducer;

impl EnrollmentReducer {
    /// Creates a new `EnrollmentReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn insert_effect(
        env: &EnrollmentEnvironment,
        request_id: RequestId,
        hike_id: HikeId,
        user_id: UserId,
        status: EnrollmentStatus,
    ) -> Effect<EnrollmentAction> {
        let repo = Arc::clone(&env.enrollments);
        async_effect! {
            Some(match repo.insert_enrollment(hike_id, user_id, status).await {
                Ok(enrollment) => EnrollmentAction::Enrolled { request_id, enrollment },
                Err(error) => EnrollmentAction::EnrollFailed { request_id, failure: error.into() },
            })
        }
    }

    fn atomic_insert_effect(
        env: &EnrollmentEnvironment,
        request_id: RequestId,
        hike_id: HikeId,
        user_id: UserId,
        max_participants: u32,
    ) -> Effect<EnrollmentAction> {
        let repo = Arc::clone(&env.enrollments);
        async_effect! {
            Some(match repo.insert_within_capacity(hike_id, user_id, max_participants).await {
                Ok(enrollment) => EnrollmentAction::Enrolled { request_id, enrollment },
                Err(error) => EnrollmentAction::EnrollFailed { request_id, failure: error.into() },
            })
        }
    }
}

impl Reducer for EnrollmentReducer {
    type State = EnrollmentState;
    type Action = EnrollmentAction;
    type Environment = EnrollmentEnvironment;

    #[allow(clippy::too_many_lines)]
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            // ========== Commands ==========
            EnrollmentAction::Enroll {
                request_id,
                actor,
                hike_id,
                max_participants,
            } => {
                let Ok(user_id) = actor.require_member() else {
                    return smallvec![emit!(EnrollmentAction::EnrollFailed {
                        request_id,
                        failure: EnrollmentFailure::NotAuthenticated,
                    })];
                };
                if state.is_busy(hike_id, user_id) {
                    tracing::debug!(%hike_id, %user_id, "Enroll already in flight for this member");
                    return smallvec![emit!(EnrollmentAction::EnrollFailed {
                        request_id,
                        failure: EnrollmentFailure::InProgress,
                    })];
                }

                state.in_flight.insert(request_id, (hike_id, user_id));
                let repo = Arc::clone(&env.enrollments);
                smallvec![async_effect! {
                    let existing = repo.get_enrollment(hike_id, user_id).await;
                    Some(EnrollmentAction::ExistingChecked {
                        request_id,
                        hike_id,
                        user_id,
                        max_participants,
                        existing,
                    })
                }]
            },

            EnrollmentAction::Unenroll {
                request_id,
                actor,
                hike_id,
            } => {
                let Ok(user_id) = actor.require_member() else {
                    return smallvec![emit!(EnrollmentAction::UnenrollFailed {
                        request_id,
                        failure: EnrollmentFailure::NotAuthenticated,
                    })];
                };
                let repo = Arc::clone(&env.enrollments);
                smallvec![async_effect! {
                    Some(match repo.delete_enrollment(hike_id, user_id).await {
                        Ok(()) => EnrollmentAction::Unenrolled { request_id, hike_id, user_id },
                        Err(error) => EnrollmentAction::UnenrollFailed {
                            request_id,
                            failure: error.into(),
                        },
                    })
                }]
            },

            // ========== Events ==========
            EnrollmentAction::ExistingChecked {
                request_id,
                hike_id,
                user_id,
                max_participants,
                existing,
            } => {
                if !state.in_flight.contains_key(&request_id) {
                    return SmallVec::new();
                }
                match existing {
                    Err(error) => smallvec![emit!(EnrollmentAction::EnrollFailed {
                        request_id,
                        failure: EnrollmentFailure::Gateway(error),
                    })],
                    Ok(Some(row)) => smallvec![emit!(EnrollmentAction::EnrollFailed {
                        request_id,
                        failure: EnrollmentFailure::AlreadyEnrolled(row.status),
                    })],
                    Ok(None) if env.atomic_capacity_check => smallvec![Self::atomic_insert_effect(
                        env,
                        request_id,
                        hike_id,
                        user_id,
                        max_participants,
                    )],
                    Ok(None) => {
                        let repo = Arc::clone(&env.enrollments);
                        smallvec![async_effect! {
                            let count = repo
                                .count_with_status(hike_id, EnrollmentStatus::Enrolled)
                                .await;
                            Some(EnrollmentAction::CountLoaded {
                                request_id,
                                hike_id,
                                user_id,
                                max_participants,
                                count,
                            })
                        }]
                    },
                }
            },

            EnrollmentAction::CountLoaded {
                request_id,
                hike_id,
                user_id,
                max_participants,
                count,
            } => {
                if !state.in_flight.contains_key(&request_id) {
                    return SmallVec::new();
                }
                match count {
                    Ok(count) => {
                        let status = decide_enrollment_status(count, max_participants);
                        tracing::debug!(%hike_id, %user_id, count, max_participants, %status, "Capacity policy decided");
                        smallvec![Self::insert_effect(env, request_id, hike_id, user_id, status)]
                    },
                    Err(error) => smallvec![emit!(EnrollmentAction::EnrollFailed {
                        request_id,
                        failure: EnrollmentFailure::Gateway(error),
                    })],
                }
            },

            EnrollmentAction::Enrolled {
                request_id,
                enrollment,
            } => {
                state.in_flight.remove(&request_id);
                metrics::record_enrollment(match enrollment.status {
                    EnrollmentStatus::Waitlisted => "waitlisted",
                    _ => "enrolled",
                });
                tracing::info!(
                    hike_id = %enrollment.hike_id,
                    user_id = %enrollment.user_id,
                    status = %enrollment.status,
                    "Member joined hike"
                );
                SmallVec::new()
            },

            EnrollmentAction::EnrollFailed {
                request_id,
                failure,
            } => {
                state.in_flight.remove(&request_id);
                metrics::record_enrollment(failure.metric_label());
                match &failure {
                    EnrollmentFailure::Conflict(message) => {
                        tracing::warn!(%request_id, %message, "Enroll lost a concurrent insert");
                    },
                    EnrollmentFailure::Gateway(error) => {
                        tracing::warn!(%request_id, %error, "Enroll failed");
                    },
                    other => tracing::debug!(%request_id, ?other, "Enroll refused"),
                }
                SmallVec::new()
            },

            EnrollmentAction::Unenrolled {
                hike_id, user_id, ..
            } => {
                metrics::record_unenrollment();
                tracing::info!(%hike_id, %user_id, "Member left hike");
                SmallVec::new()
            },

            EnrollmentAction::UnenrollFailed {
                request_id,
                failure,
            } => {
                tracing::warn!(%request_id, ?failure, "Unenroll failed");
                SmallVec::new()
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::InMemoryClubStore;
    use trailhead_testing::{assertions, test_clock, ReducerTest};

    fn env(store: &InMemoryClubStore) -> EnrollmentEnvironment {
        EnrollmentEnvironment::new(
            Arc::new(test_clock()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        )
    }

    fn enroll(actor: ActorContext, hike_id: HikeId) -> EnrollmentAction {
        EnrollmentAction::Enroll {
            request_id: RequestId::new(),
            actor,
            hike_id,
            max_participants: 2,
        }
    }

    #[test]
    fn enroll_marks_request_in_flight() {
        let store = InMemoryClubStore::new();
        let user = UserId::new();
        ReducerTest::new(EnrollmentReducer::new())
            .with_env(env(&store))
            .given_state(EnrollmentState::default())
            .when_action(enroll(ActorContext::member(user), HikeId::new()))
            .then_state(move |s| {
                assert_eq!(s.in_flight.len(), 1);
                assert!(s.in_flight.values().all(|(_, u)| *u == user));
            })
            .then_effects(assertions::assert_has_future_effect)
            .run();
    }

    #[test]
    fn anonymous_enroll_is_refused_without_state_change() {
        let store = InMemoryClubStore::new();
        ReducerTest::new(EnrollmentReducer::new())
            .with_env(env(&store))
            .given_state(EnrollmentState::default())
            .when_action(enroll(ActorContext::anonymous(), HikeId::new()))
            .then_state(|s| assert!(s.in_flight.is_empty()))
            .then_effects(|effects| assertions::assert_effects_count(effects, 1))
            .run();
    }

    #[test]
    fn second_enroll_for_same_pair_is_refused() {
        let store = InMemoryClubStore::new();
        let (hike, user) = (HikeId::new(), UserId::new());
        ReducerTest::new(EnrollmentReducer::new())
            .with_env(env(&store))
            .given_state(EnrollmentState::default())
            .given_actions([enroll(ActorContext::member(user), hike)])
            .when_action(enroll(ActorContext::member(user), hike))
            .then_state(|s| assert_eq!(s.in_flight.len(), 1))
            .run();
    }

    #[test]
    fn stale_count_is_ignored() {
        let store = InMemoryClubStore::new();
        ReducerTest::new(EnrollmentReducer::new())
            .with_env(env(&store))
            .given_state(EnrollmentState::default())
            .when_action(EnrollmentAction::CountLoaded {
                request_id: RequestId::new(),
                hike_id: HikeId::new(),
                user_id: UserId::new(),
                max_participants: 2,
                count: Ok(0),
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[tokio::test]
    async fn count_at_capacity_inserts_waitlisted() {
        let store = InMemoryClubStore::new();
        let environment = env(&store);
        let (hike, user) = (HikeId::new(), UserId::new());
        let request_id = RequestId::new();

        let mut state = EnrollmentState::default();
        state.in_flight.insert(request_id, (hike, user));

        let effects = EnrollmentReducer::new().reduce(
            &mut state,
            EnrollmentAction::CountLoaded {
                request_id,
                hike_id: hike,
                user_id: user,
                max_participants: 2,
                count: Ok(2),
            },
            &environment,
        );

        let Some(Effect::Future(insert)) = effects.into_iter().next() else {
            unreachable!("count result always leads to an insert");
        };
        let Some(EnrollmentAction::Enrolled { enrollment, .. }) = insert.await else {
            unreachable!("in-memory insert succeeds");
        };
        assert_eq!(enrollment.status, EnrollmentStatus::Waitlisted);
        assert_eq!(store.enrollments_of(hike).len(), 1);
    }

    #[test]
    fn failure_clears_in_flight() {
        let store = InMemoryClubStore::new();
        let request_id = RequestId::new();
        let mut state = EnrollmentState::default();
        state.in_flight.insert(request_id, (HikeId::new(), UserId::new()));

        ReducerTest::new(EnrollmentReducer::new())
            .with_env(env(&store))
            .given_state(state)
            .when_action(EnrollmentAction::EnrollFailed {
                request_id,
                failure: EnrollmentFailure::Conflict("duplicate".to_string()),
            })
            .then_state(|s| assert!(s.in_flight.is_empty()))
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn conflict_maps_from_gateway() {
        let failure: EnrollmentFailure = GatewayError::Conflict("dup".to_string()).into();
        assert_eq!(failure, EnrollmentFailure::Conflict("dup".to_string()));
        let failure: EnrollmentFailure = GatewayError::Unavailable("down".to_string()).into();
        assert!(matches!(failure, EnrollmentFailure::Gateway(_)));
    }
}
