//! In-memory persistence gateway.
//!
//! Implements every repository trait over one mutex-guarded set of tables.
//! Used by the demo binary and the tests; supports artificial latency (to
//! make the count-then-insert race observable), per-member write failures
//! and an outage switch.

use crate::gateway::{
    EnrollmentRepository, GatewayError, GatewayFuture, GatewayResult, HikeRepository,
    ProfileRepository, RoleRepository,
};
use crate::policy::decide_enrollment_status;
use crate::types::{
    Enrollment, EnrollmentId, EnrollmentStatus, Hike, HikeId, HistoryEntry, Participant, Profile,
    Role, UserId,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct Tables {
    hikes: HashMap<HikeId, Hike>,
    profiles: HashMap<UserId, Profile>,
    enrollments: Vec<Enrollment>,
    roles: HashMap<UserId, Vec<Role>>,
    failing_writes: HashSet<UserId>,
}

impl Tables {
    fn find(&self, hike_id: HikeId, user_id: UserId) -> Option<&Enrollment> {
        self.enrollments
            .iter()
            .find(|e| e.hike_id == hike_id && e.user_id == user_id)
    }

    fn count(&self, hike_id: HikeId, status: Option<EnrollmentStatus>) -> u64 {
        self.enrollments
            .iter()
            .filter(|e| e.hike_id == hike_id && status.is_none_or(|s| e.status == s))
            .count() as u64
    }

    fn insert(&mut self, hike_id: HikeId, user_id: UserId, status: EnrollmentStatus) -> GatewayResult<Enrollment> {
        if self.failing_writes.contains(&user_id) {
            return Err(GatewayError::Database(format!("write rejected for {user_id}")));
        }
        if self.find(hike_id, user_id).is_some() {
            return Err(GatewayError::Conflict(format!(
                "enrollment for hike {hike_id} and user {user_id} already exists"
            )));
        }
        let enrollment = Enrollment {
            id: EnrollmentId::new(),
            hike_id,
            user_id,
            status,
            enrolled_at: Utc::now(),
        };
        self.enrollments.push(enrollment.clone());
        Ok(enrollment)
    }
}

/// In-memory implementation of every gateway trait
///
/// Clones share the same tables.
#[derive(Clone, Debug, Default)]
pub struct InMemoryClubStore {
    tables: Arc<Mutex<Tables>>,
    latency: Option<Duration>,
    unavailable: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
}

impl InMemoryClubStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` before touching the tables
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self) -> GatewayResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::Acquire) {
            return Err(GatewayError::Unavailable("in-memory store switched off".to_string()));
        }
        Ok(())
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::AcqRel);
    }

    /// Add or replace a hike
    pub fn add_hike(&self, hike: Hike) {
        self.tables().hikes.insert(hike.id, hike);
    }

    /// Add or replace a profile
    pub fn add_profile(&self, profile: Profile) {
        self.tables().profiles.insert(profile.user_id, profile);
    }

    /// Insert an enrollment row directly, bypassing the engine
    ///
    /// Replaces any existing row for the pair. Not counted as a write.
    pub fn seed_enrollment(&self, hike_id: HikeId, user_id: UserId, status: EnrollmentStatus) -> Enrollment {
        let mut tables = self.tables();
        tables
            .enrollments
            .retain(|e| !(e.hike_id == hike_id && e.user_id == user_id));
        let enrollment = Enrollment {
            id: EnrollmentId::new(),
            hike_id,
            user_id,
            status,
            enrolled_at: Utc::now(),
        };
        tables.enrollments.push(enrollment.clone());
        enrollment
    }

    /// Grant a role directly
    pub fn grant(&self, user_id: UserId, role: Role) {
        let mut tables = self.tables();
        let held = tables.roles.entry(user_id).or_default();
        if !held.contains(&role) {
            held.push(role);
        }
    }

    /// Make every insert or update touching `user_id` fail
    pub fn fail_writes_for(&self, user_id: UserId) {
        self.tables().failing_writes.insert(user_id);
    }

    /// Stop failing writes for `user_id`
    pub fn heal_writes_for(&self, user_id: UserId) {
        self.tables().failing_writes.remove(&user_id);
    }

    /// Switch the whole store off (every call fails with `Unavailable`) or back on
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Successful inserts, updates and deletes so far
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    /// Snapshot of every enrollment row of a hike
    #[must_use]
    pub fn enrollments_of(&self, hike_id: HikeId) -> Vec<Enrollment> {
        self.tables()
            .enrollments
            .iter()
            .filter(|e| e.hike_id == hike_id)
            .cloned()
            .collect()
    }
}

impl EnrollmentRepository for InMemoryClubStore {
    fn count_with_status(&self, hike_id: HikeId, status: EnrollmentStatus) -> GatewayFuture<'_, u64> {
        Box::pin(async move {
            self.enter().await?;
            Ok(self.tables().count(hike_id, Some(status)))
        })
    }

    fn count_all(&self, hike_id: HikeId) -> GatewayFuture<'_, u64> {
        Box::pin(async move {
            self.enter().await?;
            Ok(self.tables().count(hike_id, None))
        })
    }

    fn get_enrollment(&self, hike_id: HikeId, user_id: UserId) -> GatewayFuture<'_, Option<Enrollment>> {
        Box::pin(async move {
            self.enter().await?;
            Ok(self.tables().find(hike_id, user_id).cloned())
        })
    }

    fn insert_enrollment(
        &self,
        hike_id: HikeId,
        user_id: UserId,
        status: EnrollmentStatus,
    ) -> GatewayFuture<'_, Enrollment> {
        Box::pin(async move {
            self.enter().await?;
            let enrollment = self.tables().insert(hike_id, user_id, status)?;
            self.record_write();
            Ok(enrollment)
        })
    }

    fn insert_within_capacity(
        &self,
        hike_id: HikeId,
        user_id: UserId,
        max_participants: u32,
    ) -> GatewayFuture<'_, Enrollment> {
        Box::pin(async move {
            self.enter().await?;
            let enrollment = {
                let mut tables = self.tables();
                let enrolled = tables.count(hike_id, Some(EnrollmentStatus::Enrolled));
                let status = decide_enrollment_status(enrolled, max_participants);
                tables.insert(hike_id, user_id, status)?
            };
            self.record_write();
            Ok(enrollment)
        })
    }

    fn delete_enrollment(&self, hike_id: HikeId, user_id: UserId) -> GatewayFuture<'_, ()> {
        Box::pin(async move {
            self.enter().await?;
            self.tables()
                .enrollments
                .retain(|e| !(e.hike_id == hike_id && e.user_id == user_id));
            self.record_write();
            Ok(())
        })
    }

    fn update_enrollment_status(
        &self,
        enrollment_id: EnrollmentId,
        status: EnrollmentStatus,
    ) -> GatewayFuture<'_, ()> {
        Box::pin(async move {
            self.enter().await?;
            {
                let mut tables = self.tables();
                let failing = tables.failing_writes.clone();
                let row = tables
                    .enrollments
                    .iter_mut()
                    .find(|e| e.id == enrollment_id)
                    .ok_or_else(|| GatewayError::NotFound(format!("enrollment {enrollment_id}")))?;
                if failing.contains(&row.user_id) {
                    return Err(GatewayError::Database(format!(
                        "write rejected for {}",
                        row.user_id
                    )));
                }
                row.status = status;
            }
            self.record_write();
            Ok(())
        })
    }

    fn list_participants(&self, hike_id: HikeId) -> GatewayFuture<'_, Vec<Participant>> {
        Box::pin(async move {
            self.enter().await?;
            let tables = self.tables();
            Ok(tables
                .enrollments
                .iter()
                .filter(|e| e.hike_id == hike_id)
                .map(|e| Participant {
                    enrollment: e.clone(),
                    profile: tables.profiles.get(&e.user_id).cloned(),
                })
                .collect())
        })
    }

    fn list_for_user(&self, user_id: UserId) -> GatewayFuture<'_, Vec<HistoryEntry>> {
        Box::pin(async move {
            self.enter().await?;
            let tables = self.tables();
            Ok(tables
                .enrollments
                .iter()
                .filter(|e| e.user_id == user_id)
                .filter_map(|e| {
                    tables.hikes.get(&e.hike_id).map(|hike| HistoryEntry {
                        hike: hike.clone(),
                        status: e.status,
                        enrolled_at: e.enrolled_at,
                    })
                })
                .collect())
        })
    }
}

impl ProfileRepository for InMemoryClubStore {
    fn find_profile(&self, user_id: UserId) -> GatewayFuture<'_, Option<Profile>> {
        Box::pin(async move {
            self.enter().await?;
            Ok(self.tables().profiles.get(&user_id).cloned())
        })
    }
}

impl HikeRepository for InMemoryClubStore {
    fn get_hike(&self, hike_id: HikeId) -> GatewayFuture<'_, Option<Hike>> {
        Box::pin(async move {
            self.enter().await?;
            Ok(self.tables().hikes.get(&hike_id).cloned())
        })
    }
}

impl RoleRepository for InMemoryClubStore {
    fn roles_for(&self, user_id: UserId) -> GatewayFuture<'_, Vec<Role>> {
        Box::pin(async move {
            self.enter().await?;
            Ok(self.tables().roles.get(&user_id).cloned().unwrap_or_default())
        })
    }

    fn assign_role(&self, user_id: UserId, role: Role) -> GatewayFuture<'_, ()> {
        Box::pin(async move {
            self.enter().await?;
            self.grant(user_id, role);
            Ok(())
        })
    }

    fn remove_role(&self, user_id: UserId, role: Role) -> GatewayFuture<'_, ()> {
        Box::pin(async move {
            self.enter().await?;
            if let Some(held) = self.tables().roles.get_mut(&user_id) {
                held.retain(|r| *r != role);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_insert_is_a_conflict() {
        let store = InMemoryClubStore::new();
        let (hike, user) = (HikeId::new(), UserId::new());

        store.insert_enrollment(hike, user, EnrollmentStatus::Enrolled).await.unwrap();
        let second = store.insert_enrollment(hike, user, EnrollmentStatus::Enrolled).await;

        assert!(matches!(second, Err(GatewayError::Conflict(_))));
        assert_eq!(store.count_all(hike).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemoryClubStore::new();
        let (hike, user) = (HikeId::new(), UserId::new());
        store.seed_enrollment(hike, user, EnrollmentStatus::Waitlisted);

        store.delete_enrollment(hike, user).await.unwrap();
        store.delete_enrollment(hike, user).await.unwrap();
        assert!(store.get_enrollment(hike, user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn atomic_insert_applies_the_policy() {
        let store = InMemoryClubStore::new();
        let hike = HikeId::new();
        store.seed_enrollment(hike, UserId::new(), EnrollmentStatus::Enrolled);
        store.seed_enrollment(hike, UserId::new(), EnrollmentStatus::Waitlisted);

        let first = store.insert_within_capacity(hike, UserId::new(), 2).await.unwrap();
        let second = store.insert_within_capacity(hike, UserId::new(), 2).await.unwrap();

        assert_eq!(first.status, EnrollmentStatus::Enrolled);
        assert_eq!(second.status, EnrollmentStatus::Waitlisted);
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let store = InMemoryClubStore::new();
        store.set_unavailable(true);
        let result = store.count_all(HikeId::new()).await;
        assert!(matches!(result, Err(GatewayError::Unavailable(_))));
    }

    #[tokio::test]
    async fn failing_member_rejects_updates() {
        let store = InMemoryClubStore::new();
        let (hike, user) = (HikeId::new(), UserId::new());
        let row = store.seed_enrollment(hike, user, EnrollmentStatus::Enrolled);
        store.fail_writes_for(user);

        let result = store.update_enrollment_status(row.id, EnrollmentStatus::Verified).await;
        assert!(matches!(result, Err(GatewayError::Database(_))));
        assert_eq!(store.write_count(), 0);
    }
}
