//! # Trailhead Testing
//!
//! Testing utilities for Trailhead reducers and stores.
//!
//! This crate provides:
//! - Deterministic clocks (`FixedClock`, `ManualClock`)
//! - [`ReducerTest`], a Given-When-Then builder for reducer unit tests
//! - Effect assertion helpers
//! - A tracing initialiser for noisy test debugging
//!
//! ## Example
//!
//! ```ignore
//! use trailhead_testing::{test_clock, ReducerTest};
//!
//! ReducerTest::new(EnrollmentReducer::new())
//!     .with_env(test_environment())
//!     .given_state(EnrollmentState::default())
//!     .when_action(EnrollmentAction::Enroll { .. })
//!     .then_state(|s| assert_eq!(s.in_flight.len(), 1))
//!     .run();
//! ```

use chrono::{DateTime, Utc};
use trailhead_core::environment::Clock;


/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time.
    ///
    /// # Example
    ///
    /// ```
    /// use trailhead_testing::mocks::FixedClock;
    /// use trailhead_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when a test advances it
    ///
    /// Clones share the same time, so a test can keep one handle and hand
    /// another to the environment under test.
    ///
    /// # Example
    ///
    /// ```
    /// use trailhead_testing::mocks::ManualClock;
    /// use trailhead_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let clock = ManualClock::new(Utc::now());
    /// let before = clock.now();
    /// clock.advance(Duration::seconds(6));
    /// assert_eq!(clock.now() - before, Duration::seconds(6));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a manual clock starting at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute time
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-06-01 08:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }

    /// Create a manual clock starting at the test epoch
    #[must_use]
    pub fn manual_test_clock() -> ManualClock {
        ManualClock::new(test_epoch())
    }

    /// The instant every test clock starts at
    #[must_use]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_748_764_800, 0).unwrap_or_default()
    }
}

/// Install a `tracing` subscriber that writes to the test harness output
///
/// Safe to call from every test; only the first call installs the
/// subscriber. Filter with `RUST_LOG`.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

pub use mocks::{manual_test_clock, test_clock, test_epoch, FixedClock, ManualClock};
pub use reducer_test::{assertions, ReducerTest};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now(), test_epoch());
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = manual_test_clock();
        let shared = clock.clone();
        clock.advance(chrono::Duration::milliseconds(1500));
        assert_eq!(shared.now() - test_epoch(), chrono::Duration::milliseconds(1500));
    }

    #[test]
    fn test_epoch_is_first_of_june() {
        assert_eq!(test_epoch().to_rfc3339(), "2025-06-01T08:00:00+00:00");
    }
}
