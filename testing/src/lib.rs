//! # Careslot Testing
//!
//! Testing utilities and helpers for the Careslot booking engine.
//!
//! This crate provides:
//! - Deterministic clocks (`FixedClock`, `MutableClock`)
//! - `ReducerTest`, a Given-When-Then builder for reducers
//! - Effect assertions
//! - A one-line tracing setup for tests that want log output
//!
//! ## Example
//!
//! ```ignore
//! use careslot_testing::{MutableClock, ReducerTest};
//!
//! let clock = MutableClock::at(monday_at(8, 0));
//! ReducerTest::new(BookingReducer::new())
//!     .with_env(env_with(clock.clone()))
//!     .given_state(state_with(pending_booking()))
//!     .when_action(BookingAction::Confirm { booking_id, recipient: None })
//!     .then_state(|state| assert_eq!(state.last_error, None))
//!     .run();
//! ```

use chrono::{DateTime, Utc};
use careslot_core::environment::Clock;


pub use reducer_test::{ReducerTest, assertions};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use chrono::Duration;
    use std::sync::{Arc, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use careslot_testing::mocks::FixedClock;
    /// use careslot_core::environment::Clock;
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

    /// Clock that tests can move forward.
    ///
    /// Clones share the same instant, so a clone handed to the system under
    /// test observes every `advance` made by the test.
    ///
    /// ```
    /// use careslot_testing::mocks::MutableClock;
    /// use careslot_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let start = Utc::now();
    /// let clock = MutableClock::at(start);
    /// let observer = clock.clone();
    /// clock.advance(Duration::hours(2));
    /// assert_eq!(observer.now(), start + Duration::hours(2));
    /// ```
    #[derive(Debug, Clone)]
    pub struct MutableClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl MutableClock {
        /// Create a clock starting at `time`
        #[must_use]
        pub fn at(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Jump to an absolute instant
        pub fn set(&self, time: DateTime<Utc>) {
            if let Ok(mut guard) = self.time.write() {
                *guard = time;
            }
        }

        /// Move the clock forward (or backward, with a negative duration)
        pub fn advance(&self, by: Duration) {
            if let Ok(mut guard) = self.time.write() {
                *guard += by;
            }
        }
    }

    impl Clock for MutableClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
                .read()
                .map_or_else(|poisoned| *poisoned.into_inner(), |guard| *guard)
        }
    }

    /// Create a default fixed clock for tests (2025-01-06 08:00:00 UTC, a Monday)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }

    /// The instant `test_clock` is frozen at
    #[must_use]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_736_150_400, 0).unwrap_or_default()
    }
}

/// Install a `tracing` subscriber that writes to the test harness output.
///
/// Safe to call from many tests; only the first call installs anything.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "careslot=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, MutableClock, test_clock, test_epoch};
