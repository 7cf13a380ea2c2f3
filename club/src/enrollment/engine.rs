//! Request/response facade over the enrollment store.

use super::{EnrollmentAction, EnrollmentEnvironment, EnrollmentError, EnrollmentReducer, EnrollmentState};
use crate::access::ActorContext;
use crate::config::EnrollmentConfig;
use crate::policy::{enrollment_control, spots_left, EnrollmentControl, HikeOverview, MemberStats};
use crate::types::{Enrollment, EnrollmentStatus, HikeId, Participant, RequestId, UserId};
use std::time::Duration;
use trailhead_runtime::{Store, StoreError};

type EnrollmentStore = Store<EnrollmentState, EnrollmentAction, EnrollmentEnvironment, EnrollmentReducer>;

/// Enrollment engine
///
/// Commands go through the reducer and wait for the correlated answer;
/// read-only queries go straight to the gateway.
#[derive(Clone)]
pub struct EnrollmentEngine {
    store: EnrollmentStore,
    request_timeout: Duration,
}

impl EnrollmentEngine {
    /// Build an engine over `environment`
    ///
    /// `config.atomic_capacity_check` overrides the environment's flag.
    #[must_use]
    pub fn new(environment: EnrollmentEnvironment, config: &EnrollmentConfig) -> Self {
        let environment = environment.with_atomic_capacity_check(config.atomic_capacity_check);
        Self {
            store: Store::new(EnrollmentState::default(), EnrollmentReducer::new(), environment),
            request_timeout: config.request_timeout(),
        }
    }

    fn env(&self) -> &EnrollmentEnvironment {
        self.store.environment()
    }

    async fn request(&self, action: EnrollmentAction, request_id: RequestId) -> Result<EnrollmentAction, EnrollmentError> {
        Ok(self
            .store
            .send_and_wait_for(action, |a| a.answers(request_id), self.request_timeout)
            .await?)
    }

    /// Join a hike as the acting member
    ///
    /// Returns the status the capacity policy decided.
    ///
    /// # Errors
    ///
    /// - [`EnrollmentError::NotAuthenticated`]: anonymous actor
    /// - [`EnrollmentError::AlreadyEnrolled`]: the member already has a row
    /// - [`EnrollmentError::Conflict`]: a concurrent insert won; retry
    /// - [`EnrollmentError::Gateway`] / [`EnrollmentError::Timeout`]
    #[tracing::instrument(skip(self, actor), fields(user_id = ?actor.user_id))]
    pub async fn enroll(
        &self,
        actor: &ActorContext,
        hike_id: HikeId,
        max_participants: u32,
    ) -> Result<EnrollmentStatus, EnrollmentError> {
        let request_id = RequestId::new();
        let action = EnrollmentAction::Enroll {
            request_id,
            actor: *actor,
            hike_id,
            max_participants,
        };
        match self.request(action, request_id).await? {
            EnrollmentAction::Enrolled { enrollment, .. } => Ok(enrollment.status),
            EnrollmentAction::EnrollFailed { failure, .. } => Err(failure.into()),
            _ => Err(EnrollmentError::Store(StoreError::ChannelClosed)),
        }
    }

    /// Leave a hike or its waitlist as the acting member
    ///
    /// Leaving a hike the member never joined succeeds. Nobody on the
    /// waitlist is promoted.
    ///
    /// # Errors
    ///
    /// [`EnrollmentError::NotAuthenticated`], gateway failures, timeouts.
    #[tracing::instrument(skip(self, actor), fields(user_id = ?actor.user_id))]
    pub async fn unenroll(&self, actor: &ActorContext, hike_id: HikeId) -> Result<(), EnrollmentError> {
        let request_id = RequestId::new();
        let action = EnrollmentAction::Unenroll {
            request_id,
            actor: *actor,
            hike_id,
        };
        match self.request(action, request_id).await? {
            EnrollmentAction::Unenrolled { .. } => Ok(()),
            EnrollmentAction::UnenrollFailed { failure, .. } => Err(failure.into()),
            _ => Err(EnrollmentError::Store(StoreError::ChannelClosed)),
        }
    }

    /// Current row for (hike, member)
    ///
    /// # Errors
    ///
    /// Gateway failures.
    pub async fn enrollment(&self, hike_id: HikeId, user_id: UserId) -> Result<Option<Enrollment>, EnrollmentError> {
        Ok(self.env().enrollments.get_enrollment(hike_id, user_id).await?)
    }

    /// Join button state for the acting member
    ///
    /// # Errors
    ///
    /// Gateway failures.
    pub async fn control(
        &self,
        actor: &ActorContext,
        hike_id: HikeId,
        max_participants: u32,
    ) -> Result<EnrollmentControl, EnrollmentError> {
        let existing = match actor.user_id {
            Some(user_id) => self
                .enrollment(hike_id, user_id)
                .await?
                .map(|row| row.status),
            None => None,
        };
        let enrolled = self
            .env()
            .enrollments
            .count_with_status(hike_id, EnrollmentStatus::Enrolled)
            .await?;
        Ok(enrollment_control(existing, spots_left(max_participants, enrolled)))
    }

    /// Hike card data: capacity figures and derived status
    ///
    /// # Errors
    ///
    /// [`EnrollmentError::HikeNotFound`] or gateway failures.
    pub async fn hike_overview(&self, hike_id: HikeId) -> Result<HikeOverview, EnrollmentError> {
        let env = self.env();
        let hike = env
            .hikes
            .get_hike(hike_id)
            .await?
            .ok_or(EnrollmentError::HikeNotFound(hike_id))?;
        let enrolled = env
            .enrollments
            .count_with_status(hike_id, EnrollmentStatus::Enrolled)
            .await?;
        Ok(HikeOverview::new(hike, enrolled, env.clock.today()))
    }

    /// Everyone on a hike, with profiles
    ///
    /// # Errors
    ///
    /// Gateway failures.
    pub async fn participants(&self, hike_id: HikeId) -> Result<Vec<Participant>, EnrollmentError> {
        Ok(self.env().enrollments.list_participants(hike_id).await?)
    }

    /// Profile statistics for a member
    ///
    /// # Errors
    ///
    /// Gateway failures.
    pub async fn member_stats(&self, user_id: UserId) -> Result<MemberStats, EnrollmentError> {
        let env = self.env();
        let history = env.enrollments.list_for_user(user_id).await?;
        Ok(MemberStats::from_history(&history, env.clock.today()))
    }

    /// Stop accepting requests and wait for running ones
    ///
    /// # Errors
    ///
    /// [`EnrollmentError::Store`] if requests are still running after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), EnrollmentError> {
        Ok(self.store.shutdown(timeout).await?)
    }
}
