//! Capacity policy.
//!
//! Pure decisions shared by self-enrollment, the atomic gateway insert and
//! the verification walk-in flag. Nothing here touches I/O.

use crate::types::{EnrollmentStatus, Hike, HikeStatus, HistoryEntry};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Status a new enrollment gets given the current `enrolled` count
///
/// `Enrolled` while `enrolled_count < max_participants`, otherwise
/// `Waitlisted`. Waitlisted and verified rows do not take a spot.
#[must_use]
pub const fn decide_enrollment_status(enrolled_count: u64, max_participants: u32) -> EnrollmentStatus {
    if enrolled_count < max_participants as u64 {
        EnrollmentStatus::Enrolled
    } else {
        EnrollmentStatus::Waitlisted
    }
}

/// Spots left for display
///
/// Signed: goes negative when the hike is over-enrolled (possible through
/// the non-atomic enroll path).
#[must_use]
pub fn spots_left(max_participants: u32, enrolled_count: u64) -> i64 {
    let enrolled = i64::try_from(enrolled_count).unwrap_or(i64::MAX);
    i64::from(max_participants).saturating_sub(enrolled)
}

/// What the join button offers a member
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnrollmentControl {
    /// No row, spots available
    Enroll,
    /// No row, hike full
    JoinWaitlist,
    /// Member holds a non-waitlisted row
    Unenroll,
    /// Member is on the waitlist
    LeaveWaitlist,
}

impl EnrollmentControl {
    /// Button label
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Enroll => "Enroll Now",
            Self::JoinWaitlist => "Join Waitlist",
            Self::Unenroll => "Unenroll",
            Self::LeaveWaitlist => "Leave Waitlist",
        }
    }
}

/// Join button state for a member's existing status and the spots left
#[must_use]
pub const fn enrollment_control(existing: Option<EnrollmentStatus>, spots_left: i64) -> EnrollmentControl {
    match existing {
        Some(EnrollmentStatus::Waitlisted) => EnrollmentControl::LeaveWaitlist,
        Some(_) => EnrollmentControl::Unenroll,
        None if spots_left <= 0 => EnrollmentControl::JoinWaitlist,
        None => EnrollmentControl::Enroll,
    }
}

/// Hike card data: the hike plus its live capacity figures
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HikeOverview {
    /// The hike
    pub hike: Hike,
    /// Rows with status `enrolled`
    pub enrolled: u64,
    /// Signed spots left
    pub spots_left: i64,
    /// Derived status
    pub status: HikeStatus,
}

impl HikeOverview {
    /// Build the overview for `hike` as of `today`
    #[must_use]
    pub fn new(hike: Hike, enrolled: u64, today: NaiveDate) -> Self {
        let spots_left = spots_left(hike.max_participants, enrolled);
        let status = hike.status_on(today);
        Self {
            hike,
            enrolled,
            spots_left,
            status,
        }
    }
}

/// Totals for a member's profile page
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberStats {
    /// Enrolled or verified on a hike that is over
    pub completed: u32,
    /// Enrolled on a hike still ahead
    pub upcoming: u32,
    /// Waitlisted anywhere
    pub waitlisted: u32,
    /// Kilometres over completed hikes
    pub total_distance_km: f64,
    /// Metres of elevation over completed hikes
    pub total_elevation_m: i64,
}

impl MemberStats {
    /// Classify a member's enrollment history as of `today`
    #[must_use]
    pub fn from_history(entries: &[HistoryEntry], today: NaiveDate) -> Self {
        let mut stats = Self::default();
        for entry in entries {
            let status = entry.hike.status_on(today);
            match (entry.status, status) {
                (EnrollmentStatus::Enrolled | EnrollmentStatus::Verified, HikeStatus::Completed) => {
                    stats.completed += 1;
                    stats.total_distance_km += entry.hike.distance_km;
                    stats.total_elevation_m += i64::from(entry.hike.elevation_m);
                },
                (EnrollmentStatus::Enrolled, HikeStatus::Upcoming) => stats.upcoming += 1,
                (EnrollmentStatus::Waitlisted, _) => stats.waitlisted += 1,
                (EnrollmentStatus::Verified, HikeStatus::Upcoming) => {},
            }
        }
        stats
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::HikeId;
    use chrono::Utc;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn enrolled_iff_below_capacity(count in 0u64..500, max in 0u32..200) {
            let status = decide_enrollment_status(count, max);
            prop_assert_eq!(status == EnrollmentStatus::Enrolled, count < u64::from(max));
        }

        #[test]
        fn spots_left_never_panics(max in any::<u32>(), count in any::<u64>()) {
            let left = spots_left(max, count);
            prop_assert!(left <= i64::from(max));
        }

        #[test]
        fn full_hike_offers_waitlist(spots in i64::MIN..=0) {
            prop_assert_eq!(enrollment_control(None, spots), EnrollmentControl::JoinWaitlist);
        }
    }

    #[test]
    fn two_of_two_waitlists_the_third() {
        assert_eq!(decide_enrollment_status(2, 2), EnrollmentStatus::Waitlisted);
        assert_eq!(decide_enrollment_status(1, 2), EnrollmentStatus::Enrolled);
        assert_eq!(decide_enrollment_status(0, 0), EnrollmentStatus::Waitlisted);
    }

    #[test]
    fn over_enrolled_hike_shows_negative_spots() {
        assert_eq!(spots_left(2, 3), -1);
        assert_eq!(spots_left(10, 4), 6);
    }

    #[test]
    fn control_labels() {
        assert_eq!(
            enrollment_control(Some(EnrollmentStatus::Waitlisted), 5).label(),
            "Leave Waitlist"
        );
        assert_eq!(enrollment_control(Some(EnrollmentStatus::Enrolled), 0).label(), "Unenroll");
        assert_eq!(enrollment_control(Some(EnrollmentStatus::Verified), 3), EnrollmentControl::Unenroll);
        assert_eq!(enrollment_control(None, 0).label(), "Join Waitlist");
        assert_eq!(enrollment_control(None, 1).label(), "Enroll Now");
    }

    fn entry(date: &str, distance_km: f64, elevation_m: i32, status: EnrollmentStatus) -> HistoryEntry {
        HistoryEntry {
            hike: Hike {
                id: HikeId::new(),
                name: format!("Hike on {date}"),
                description: None,
                date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
                end_date: None,
                difficulty: "easy".to_string(),
                distance_km,
                elevation_m,
                duration: "3h".to_string(),
                location_name: "Lake".to_string(),
                location_lat: 0.0,
                location_lng: 0.0,
                max_participants: 10,
                organizer_id: None,
                organizer_name: "Club".to_string(),
            },
            status,
            enrolled_at: Utc::now(),
        }
    }

    #[test]
    fn member_stats_classify_history() {
        let today = NaiveDate::parse_from_str("2025-06-10", "%Y-%m-%d").unwrap();
        let history = vec![
            entry("2025-05-01", 10.0, 500, EnrollmentStatus::Verified),
            entry("2025-05-20", 8.5, 300, EnrollmentStatus::Enrolled),
            entry("2025-06-20", 12.0, 900, EnrollmentStatus::Enrolled),
            entry("2025-06-25", 5.0, 100, EnrollmentStatus::Waitlisted),
            entry("2025-05-02", 30.0, 2000, EnrollmentStatus::Waitlisted),
        ];

        let stats = MemberStats::from_history(&history, today);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.upcoming, 1);
        assert_eq!(stats.waitlisted, 2);
        assert!((stats.total_distance_km - 18.5).abs() < f64::EPSILON);
        assert_eq!(stats.total_elevation_m, 800);
    }
}
