//! Domain types for the hike club.
//!
//! Identifiers, hikes, enrollments, profiles and roles. Everything here is
//! plain data; behaviour lives in [`crate::policy`] and the reducers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a hike
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HikeId(Uuid);

impl HikeId {
    /// Creates a new random `HikeId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `HikeId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for HikeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HikeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a member (the auth user id)
///
/// Member badges encode this id as a QR code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(Uuid);

impl UserId {
    /// Creates a new random `UserId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `UserId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Row id of an enrollment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnrollmentId(Uuid);

impl EnrollmentId {
    /// Creates a new random `EnrollmentId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `EnrollmentId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EnrollmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnrollmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates a command sent to a store with the action that answers it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Creates a new random `RequestId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Hikes
// ============================================================================

/// Whether a hike is still ahead or already over
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HikeStatus {
    /// The last day of the hike is today or later
    Upcoming,
    /// The last day of the hike is in the past
    Completed,
}

/// A scheduled club hike
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hike {
    /// Hike id
    pub id: HikeId,
    /// Display name
    pub name: String,
    /// Free-form description
    pub description: Option<String>,
    /// First day
    pub date: NaiveDate,
    /// Last day of a multi-day trip
    pub end_date: Option<NaiveDate>,
    /// Difficulty label (easy, moderate, hard, ...)
    pub difficulty: String,
    /// Distance in kilometres
    pub distance_km: f64,
    /// Elevation gain in metres
    pub elevation_m: i32,
    /// Expected duration, as entered by the organiser
    pub duration: String,
    /// Meeting point name
    pub location_name: String,
    /// Meeting point latitude
    pub location_lat: f64,
    /// Meeting point longitude
    pub location_lng: f64,
    /// Capacity
    pub max_participants: u32,
    /// Organising member, if they have an account
    pub organizer_id: Option<UserId>,
    /// Organiser display name
    pub organizer_name: String,
}

impl Hike {
    /// Last day of the hike (`end_date`, falling back to `date`)
    #[must_use]
    pub fn last_day(&self) -> NaiveDate {
        self.end_date.unwrap_or(self.date)
    }

    /// Derived status relative to `today`
    ///
    /// A hike is completed once its last day is strictly before today, so a
    /// hike happening today is still upcoming.
    #[must_use]
    pub fn status_on(&self, today: NaiveDate) -> HikeStatus {
        if self.last_day() < today {
            HikeStatus::Completed
        } else {
            HikeStatus::Upcoming
        }
    }
}

// ============================================================================
// Enrollments
// ============================================================================

/// Status of an enrollment row
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    /// Holds a spot
    Enrolled,
    /// Joined while the hike was full
    Waitlisted,
    /// Attendance confirmed by a badge scan. Terminal.
    Verified,
}

impl EnrollmentStatus {
    /// Storage representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enrolled => "enrolled",
            Self::Waitlisted => "waitlisted",
            Self::Verified => "verified",
        }
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown enrollment status string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown enrollment status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for EnrollmentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enrolled" => Ok(Self::Enrolled),
            "waitlisted" => Ok(Self::Waitlisted),
            "verified" => Ok(Self::Verified),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One member's relationship with one hike
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    /// Row id
    pub id: EnrollmentId,
    /// Hike
    pub hike_id: HikeId,
    /// Member
    pub user_id: UserId,
    /// Current status
    pub status: EnrollmentStatus,
    /// When the row was created
    pub enrolled_at: DateTime<Utc>,
}

// ============================================================================
// Profiles & roles
// ============================================================================

/// Member profile
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Member id
    pub user_id: UserId,
    /// Full name, if the member filled it in
    pub full_name: Option<String>,
    /// Contact email
    pub email: Option<String>,
    /// Avatar image URL
    pub avatar_url: Option<String>,
}

impl Profile {
    /// Name to show in lists: full name, then email, then a placeholder
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or("Unknown member")
    }
}

/// An enrollment joined with the member's profile
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Enrollment row
    pub enrollment: Enrollment,
    /// Profile, absent when the member never completed one
    pub profile: Option<Profile>,
}

/// One line of a member's history: a hike and their status on it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The hike
    pub hike: Hike,
    /// Member's status on that hike
    pub status: EnrollmentStatus,
    /// When they joined
    pub enrolled_at: DateTime<Utc>,
}

/// Application role
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full access: roles, attendance verification
    Admin,
    /// Organises hikes
    Moderator,
    /// Regular member
    User,
}

impl Role {
    /// Storage representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Moderator => "moderator",
            Self::User => "user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown role string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "moderator" => Ok(Self::Moderator),
            "user" => Ok(Self::User),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn hike(date: NaiveDate, end_date: Option<NaiveDate>) -> Hike {
        Hike {
            id: HikeId::new(),
            name: "Ridge loop".to_string(),
            description: None,
            date,
            end_date,
            difficulty: "moderate".to_string(),
            distance_km: 14.5,
            elevation_m: 820,
            duration: "5h".to_string(),
            location_name: "Trailhead car park".to_string(),
            location_lat: 46.5,
            location_lng: 8.1,
            max_participants: 12,
            organizer_id: None,
            organizer_name: "Club".to_string(),
        }
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn hike_today_is_upcoming() {
        let h = hike(day("2025-06-01"), None);
        assert_eq!(h.status_on(day("2025-06-01")), HikeStatus::Upcoming);
        assert_eq!(h.status_on(day("2025-06-02")), HikeStatus::Completed);
    }

    #[test]
    fn multi_day_hike_uses_end_date() {
        let h = hike(day("2025-06-01"), Some(day("2025-06-03")));
        assert_eq!(h.status_on(day("2025-06-03")), HikeStatus::Upcoming);
        assert_eq!(h.status_on(day("2025-06-04")), HikeStatus::Completed);
    }

    #[test]
    fn status_strings_parse_back() {
        for status in [
            EnrollmentStatus::Enrolled,
            EnrollmentStatus::Waitlisted,
            EnrollmentStatus::Verified,
        ] {
            assert_eq!(status.as_str().parse::<EnrollmentStatus>().unwrap(), status);
        }
        assert!("pending".parse::<EnrollmentStatus>().is_err());
        assert_eq!("moderator".parse::<Role>().unwrap(), Role::Moderator);
    }

    #[test]
    fn hike_serializes_with_lowercase_statuses() {
        let h = hike(day("2025-06-01"), None);
        let json = serde_json::to_value(&h).unwrap();
        assert_eq!(json["date"], "2025-06-01");
        assert_eq!(json["max_participants"], 12);
        assert_eq!(serde_json::from_value::<Hike>(json).unwrap(), h);

        assert_eq!(
            serde_json::to_string(&EnrollmentStatus::Waitlisted).unwrap(),
            "\"waitlisted\""
        );
        assert_eq!(serde_json::to_string(&HikeStatus::Completed).unwrap(), "\"completed\"");
    }

    #[test]
    fn display_name_falls_back_to_email() {
        let mut profile = Profile {
            user_id: UserId::new(),
            full_name: None,
            email: Some("ana@example.org".to_string()),
            avatar_url: None,
        };
        assert_eq!(profile.display_name(), "ana@example.org");
        profile.email = None;
        assert_eq!(profile.display_name(), "Unknown member");
    }
}
