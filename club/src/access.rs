//! Who is acting, and what they may do.
//!
//! The acting member is passed explicitly as an [`ActorContext`] to every
//! operation that cares, never read from a global.

use crate::gateway::{GatewayError, RoleRepository};
use crate::types::{Role, UserId};
use serde::{Deserialize, Serialize};

/// Access errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    /// No signed-in member
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The member lacks the admin role
    #[error("Admin role required")]
    Forbidden,

    /// Role lookup or change failed
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

/// The acting member
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    /// Signed-in member, `None` for anonymous visitors
    pub user_id: Option<UserId>,
    /// Whether the member holds the admin role
    pub is_admin: bool,
}

impl ActorContext {
    /// Anonymous visitor
    #[must_use]
    pub const fn anonymous() -> Self {
        Self {
            user_id: None,
            is_admin: false,
        }
    }

    /// Signed-in member without admin rights
    #[must_use]
    pub const fn member(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            is_admin: false,
        }
    }

    /// Signed-in admin
    #[must_use]
    pub const fn admin(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            is_admin: true,
        }
    }

    /// Build the context from a member id and the roles they hold
    #[must_use]
    pub fn resolve(user_id: Option<UserId>, roles: &[Role]) -> Self {
        Self {
            user_id,
            is_admin: user_id.is_some() && roles.contains(&Role::Admin),
        }
    }

    /// The member id, or [`AccessError::NotAuthenticated`]
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::NotAuthenticated`] for anonymous visitors.
    pub const fn require_member(&self) -> Result<UserId, AccessError> {
        match self.user_id {
            Some(user_id) => Ok(user_id),
            None => Err(AccessError::NotAuthenticated),
        }
    }

    /// Ok only for a signed-in admin
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::NotAuthenticated`] or [`AccessError::Forbidden`].
    pub const fn require_admin(&self) -> Result<UserId, AccessError> {
        match (self.user_id, self.is_admin) {
            (None, _) => Err(AccessError::NotAuthenticated),
            (Some(_), false) => Err(AccessError::Forbidden),
            (Some(user_id), true) => Ok(user_id),
        }
    }
}

/// Look up a member's roles and build their context
///
/// # Errors
///
/// Returns [`AccessError::Gateway`] if the role lookup fails.
pub async fn load_actor(
    roles: &dyn RoleRepository,
    user_id: Option<UserId>,
) -> Result<ActorContext, AccessError> {
    let Some(id) = user_id else {
        return Ok(ActorContext::anonymous());
    };
    let held = roles.roles_for(id).await?;
    Ok(ActorContext::resolve(Some(id), &held))
}

/// Grant `role` to `user_id`. Admin only.
///
/// # Errors
///
/// Returns [`AccessError::Forbidden`] for non-admins, or the gateway failure.
#[tracing::instrument(skip(roles), fields(actor = ?actor.user_id))]
pub async fn assign_role(
    actor: &ActorContext,
    roles: &dyn RoleRepository,
    user_id: UserId,
    role: Role,
) -> Result<(), AccessError> {
    actor.require_admin()?;
    roles.assign_role(user_id, role).await?;
    tracing::info!(%user_id, %role, "Role assigned");
    Ok(())
}

/// Revoke `role` from `user_id`. Admin only.
///
/// # Errors
///
/// Returns [`AccessError::Forbidden`] for non-admins, or the gateway failure.
#[tracing::instrument(skip(roles), fields(actor = ?actor.user_id))]
pub async fn remove_role(
    actor: &ActorContext,
    roles: &dyn RoleRepository,
    user_id: UserId,
    role: Role,
) -> Result<(), AccessError> {
    actor.require_admin()?;
    roles.remove_role(user_id, role).await?;
    tracing::info!(%user_id, %role, "Role removed");
    Ok(())
}
