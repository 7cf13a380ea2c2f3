//! Persistence gateway traits.
//!
//! The relational store is an external collaborator. Reducers reach it only
//! through these traits, injected as `Arc<dyn ...>` in their environments.
//!
//! Methods return `BoxFuture` instead of using `async fn` so the traits stay
//! dyn-compatible.

use crate::types::{
    Enrollment, EnrollmentId, EnrollmentStatus, Hike, HikeId, HistoryEntry, Participant, Profile,
    Role, UserId,
};
use futures::future::BoxFuture;

/// Errors reported by a persistence gateway
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The addressed row does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A concurrent write already created the row (unique violation)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The store rejected or failed the statement
    #[error("Database error: {0}")]
    Database(String),

    /// The store could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for gateway calls
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Future returned by every gateway method
pub type GatewayFuture<'a, T> = BoxFuture<'a, GatewayResult<T>>;

/// Enrollment table access
pub trait EnrollmentRepository: Send + Sync {
    /// Count rows of `hike_id` with the given status
    fn count_with_status(&self, hike_id: HikeId, status: EnrollmentStatus) -> GatewayFuture<'_, u64>;

    /// Count every row of `hike_id`, whatever the status
    fn count_all(&self, hike_id: HikeId) -> GatewayFuture<'_, u64>;

    /// The (hike, user) row, if any
    fn get_enrollment(&self, hike_id: HikeId, user_id: UserId) -> GatewayFuture<'_, Option<Enrollment>>;

    /// Insert a row with the given status
    ///
    /// Fails with [`GatewayError::Conflict`] if the pair already has a row.
    fn insert_enrollment(
        &self,
        hike_id: HikeId,
        user_id: UserId,
        status: EnrollmentStatus,
    ) -> GatewayFuture<'_, Enrollment>;

    /// Count `enrolled` rows and insert with the policy's status as one
    /// atomic step
    ///
    /// Fails with [`GatewayError::Conflict`] if the pair already has a row.
    fn insert_within_capacity(
        &self,
        hike_id: HikeId,
        user_id: UserId,
        max_participants: u32,
    ) -> GatewayFuture<'_, Enrollment>;

    /// Delete the (hike, user) row. Deleting nothing succeeds.
    fn delete_enrollment(&self, hike_id: HikeId, user_id: UserId) -> GatewayFuture<'_, ()>;

    /// Set the status of an existing row
    ///
    /// Fails with [`GatewayError::NotFound`] if the row is gone.
    fn update_enrollment_status(
        &self,
        enrollment_id: EnrollmentId,
        status: EnrollmentStatus,
    ) -> GatewayFuture<'_, ()>;

    /// Every enrollment of a hike joined with the member's profile, oldest first
    fn list_participants(&self, hike_id: HikeId) -> GatewayFuture<'_, Vec<Participant>>;

    /// Every enrollment of a member joined with its hike
    fn list_for_user(&self, user_id: UserId) -> GatewayFuture<'_, Vec<HistoryEntry>>;
}

/// Profile table access
pub trait ProfileRepository: Send + Sync {
    /// Profile of `user_id`, if the member exists
    fn find_profile(&self, user_id: UserId) -> GatewayFuture<'_, Option<Profile>>;
}

/// Hike table access
pub trait HikeRepository: Send + Sync {
    /// The hike, if it exists
    fn get_hike(&self, hike_id: HikeId) -> GatewayFuture<'_, Option<Hike>>;
}

/// Role assignments
pub trait RoleRepository: Send + Sync {
    /// Roles held by `user_id`
    fn roles_for(&self, user_id: UserId) -> GatewayFuture<'_, Vec<Role>>;

    /// Grant a role. Granting a held role succeeds.
    fn assign_role(&self, user_id: UserId, role: Role) -> GatewayFuture<'_, ()>;

    /// Revoke a role. Revoking a missing role succeeds.
    fn remove_role(&self, user_id: UserId, role: Role) -> GatewayFuture<'_, ()>;
}
