//! Enrollment engine: joining and leaving hikes under the capacity policy.

mod engine;
mod reducer;

pub use engine::EnrollmentEngine;
pub use reducer::{
    EnrollmentAction, EnrollmentEnvironment, EnrollmentFailure, EnrollmentReducer, EnrollmentState,
};

use crate::gateway::GatewayError;
use crate::types::{EnrollmentStatus, HikeId};
use trailhead_runtime::StoreError;

/// Errors returned by the [`EnrollmentEngine`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnrollmentError {
    /// No signed-in member
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The member already has a row for this hike
    #[error("Already {0} for this hike")]
    AlreadyEnrolled(EnrollmentStatus),

    /// Another request for the same member and hike is still running
    #[error("An enrollment request for this hike is already in progress")]
    InProgress,

    /// A concurrent request created the row first. Retrying is safe.
    #[error("Enrollment conflict: {0}")]
    Conflict(String),

    /// Unknown hike
    #[error("Hike {0} not found")]
    HikeNotFound(HikeId),

    /// Gateway failure
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// No answer within the request timeout
    #[error("Enrollment request timed out")]
    Timeout,

    /// Store failure (shutting down, channel closed)
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for EnrollmentError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Timeout => Self::Timeout,
            other => Self::Store(other),
        }
    }
}

impl From<EnrollmentFailure> for EnrollmentError {
    fn from(failure: EnrollmentFailure) -> Self {
        match failure {
            EnrollmentFailure::NotAuthenticated => Self::NotAuthenticated,
            EnrollmentFailure::AlreadyEnrolled(status) => Self::AlreadyEnrolled(status),
            EnrollmentFailure::InProgress => Self::InProgress,
            EnrollmentFailure::Conflict(message) => Self::Conflict(message),
            EnrollmentFailure::Gateway(error) => Self::Gateway(error),
        }
    }
}
