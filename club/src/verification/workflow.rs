//! Request/response facade over the verification store.

use super::capture::CaptureDevice;
use super::reducer::{
    millis, ApplyRejection, VerificationAction, VerificationEnvironment, VerificationReducer,
    VerificationState,
};
use super::session::{ScanSignal, SessionSummary};
use crate::access::{AccessError, ActorContext};
use crate::config::VerificationConfig;
use crate::gateway::GatewayError;
use crate::types::{HikeId, RequestId};
use std::sync::Arc;
use std::time::Duration;
use trailhead_core::environment::Clock;
use trailhead_runtime::{Store, StoreError};

type VerificationStore =
    Store<VerificationState, VerificationAction, VerificationEnvironment, VerificationReducer>;

/// Errors returned by the [`VerificationWorkflow`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    /// No signed-in member
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Only admins may verify attendance
    #[error("Admin role required")]
    Forbidden,

    /// No open session
    #[error("No verification session is open")]
    SessionClosed,

    /// Apply with an empty list
    #[error("No users to verify")]
    NothingToApply,

    /// Apply while another apply runs
    #[error("Verification is already being applied")]
    ApplyInProgress,

    /// Apply while a scan is still resolving
    #[error("A scan is still being processed")]
    ScanInFlight,

    /// Some entries could not be written. The list is kept.
    #[error("Failed to apply verify badges: {failed} of {total} failed ({first_error})")]
    AggregateApply {
        /// Entries that failed
        failed: usize,
        /// Entries attempted
        total: usize,
        /// First failure
        first_error: String,
    },

    /// Gateway failure
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// No answer within the request timeout
    #[error("Verification request timed out")]
    Timeout,

    /// Store failure (shutting down, channel closed)
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for VerificationError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Timeout => Self::Timeout,
            other => Self::Store(other),
        }
    }
}

impl From<AccessError> for VerificationError {
    fn from(error: AccessError) -> Self {
        match error {
            AccessError::NotAuthenticated => Self::NotAuthenticated,
            AccessError::Forbidden => Self::Forbidden,
            AccessError::Gateway(error) => Self::Gateway(error),
        }
    }
}

impl From<ApplyRejection> for VerificationError {
    fn from(rejection: ApplyRejection) -> Self {
        match rejection {
            ApplyRejection::NoSession => Self::SessionClosed,
            ApplyRejection::NothingToApply => Self::NothingToApply,
            ApplyRejection::ApplyInProgress => Self::ApplyInProgress,
            ApplyRejection::ScanInFlight => Self::ScanInFlight,
        }
    }
}

/// Outcome of a successful apply
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApplyReport {
    /// Enrollments marked verified
    pub verified: usize,
    /// Rows of the hike after the apply, if they could be read
    pub total_enrolled: Option<u64>,
    /// Verified rows after the apply, if they could be read
    pub total_verified: Option<u64>,
}

/// Attendance verification workflow
///
/// Wraps a store running the [`VerificationReducer`]. Camera frames flow
/// in through the supervisor in the environment; everything else goes
/// through the methods here.
#[derive(Clone)]
pub struct VerificationWorkflow {
    store: VerificationStore,
    config: VerificationConfig,
}

impl VerificationWorkflow {
    /// Build a workflow over `environment`
    #[must_use]
    pub fn new(environment: VerificationEnvironment) -> Self {
        let config = environment.settings.clone();
        Self {
            store: Store::new(VerificationState::default(), VerificationReducer::new(), environment),
            config,
        }
    }

    async fn request(
        &self,
        action: VerificationAction,
        request_id: RequestId,
    ) -> Result<VerificationAction, VerificationError> {
        Ok(self
            .store
            .send_and_wait_for(action, |a| a.answers(request_id), self.config.request_timeout())
            .await?)
    }

    async fn send(&self, action: VerificationAction) -> Result<(), VerificationError> {
        self.store.send(action).await?;
        Ok(())
    }

    /// Open a session for a hike and start the camera
    ///
    /// Waits for the gateway counts. A failed count load still opens the
    /// session; the summary then reports `counts_loaded: false`.
    ///
    /// # Errors
    ///
    /// - [`VerificationError::NotAuthenticated`] / [`VerificationError::Forbidden`]
    /// - [`VerificationError::Timeout`]
    #[tracing::instrument(skip(self, actor), fields(user_id = ?actor.user_id))]
    pub async fn open(
        &self,
        actor: &ActorContext,
        hike_id: HikeId,
        max_participants: u32,
    ) -> Result<SessionSummary, VerificationError> {
        let request_id = RequestId::new();
        let action = VerificationAction::Open {
            request_id,
            actor: *actor,
            hike_id,
            max_participants,
        };
        match self.request(action, request_id).await? {
            VerificationAction::OpenRejected { reason, .. } => Err(reason.into()),
            _ => self.summary().await.ok_or(VerificationError::SessionClosed),
        }
    }

    /// Submit a payload as if it had been scanned
    ///
    /// Unlike camera frames, repeats are not subject to the cooldown.
    ///
    /// # Errors
    ///
    /// [`VerificationError::Timeout`] and store failures. Scan outcomes,
    /// including lookup failures, are reported as a [`ScanSignal`].
    pub async fn on_scan(&self, payload: impl Into<String>) -> Result<ScanSignal, VerificationError> {
        let request_id = RequestId::new();
        let action = VerificationAction::SubmitScan {
            request_id,
            payload: payload.into(),
        };
        match self.request(action, request_id).await? {
            VerificationAction::ScanSettled { signal, .. } => Ok(signal),
            _ => Err(VerificationError::Store(StoreError::ChannelClosed)),
        }
    }

    /// Current session projection, `None` when no session is open
    pub async fn summary(&self) -> Option<SessionSummary> {
        let now = self.store.environment().clock.now();
        let ttl = millis(self.config.feedback_ttl_ms);
        self.store.state(|s| s.summary(now, ttl)).await
    }

    /// Mark every listed member verified and close the session
    ///
    /// Listed members without a row are inserted as verified. On partial
    /// failure the session stays open with its list intact.
    ///
    /// # Errors
    ///
    /// - [`VerificationError::SessionClosed`] / [`VerificationError::NothingToApply`]
    /// - [`VerificationError::ApplyInProgress`] / [`VerificationError::ScanInFlight`]
    /// - [`VerificationError::AggregateApply`]: some writes failed
    /// - [`VerificationError::Timeout`]
    #[tracing::instrument(skip(self))]
    pub async fn apply(&self) -> Result<ApplyReport, VerificationError> {
        let request_id = RequestId::new();
        match self.request(VerificationAction::Apply { request_id }, request_id).await? {
            VerificationAction::Applied {
                verified, counts, ..
            } => Ok(ApplyReport {
                verified,
                total_enrolled: counts.map(|c| c.total_enrolled),
                total_verified: counts.map(|c| c.total_verified),
            }),
            VerificationAction::ApplyFailed {
                failed,
                total,
                first_error,
                ..
            } => Err(VerificationError::AggregateApply {
                failed,
                total,
                first_error,
            }),
            VerificationAction::ApplyRejected { reason, .. } => Err(reason.into()),
            _ => Err(VerificationError::Store(StoreError::ChannelClosed)),
        }
    }

    /// Discard the session without writing anything
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn close(&self) -> Result<(), VerificationError> {
        self.send(VerificationAction::Close).await
    }

    /// Switch to the list view, stopping the camera
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn show_list(&self) -> Result<(), VerificationError> {
        self.send(VerificationAction::ShowList).await
    }

    /// Switch back to the scanner view, starting a fresh capture
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn show_scanner(&self) -> Result<(), VerificationError> {
        self.send(VerificationAction::ShowScanner).await
    }

    /// The page became visible again
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn visibility_regained(&self) -> Result<(), VerificationError> {
        self.send(VerificationAction::VisibilityRegained).await
    }

    /// The window regained focus
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn focus_regained(&self) -> Result<(), VerificationError> {
        self.send(VerificationAction::FocusRegained).await
    }

    /// Swap the camera and restart the capture on it
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn attach_capture(&self, device: Arc<dyn CaptureDevice>) -> Result<(), VerificationError> {
        self.store.environment().capture.attach(device);
        self.send(VerificationAction::CaptureAttached).await
    }

    /// Close any open session, then shut the store down
    ///
    /// # Errors
    ///
    /// [`VerificationError::Store`] when effects outlive `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), VerificationError> {
        if !self.store.is_shut_down() {
            self.send(VerificationAction::Close).await?;
        }
        self.store.shutdown(timeout).await?;
        Ok(())
    }
}
