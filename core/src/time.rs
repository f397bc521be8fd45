//! Utilities for timestamps and durations.

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use std::{
    fmt::{Debug, Formatter},
    sync::{Arc, Mutex},
};

/// A clock knows what time it currently is.
pub trait Clock: 'static + Clone + Debug + Sync + Send {
    /// Get the current time, as a UTC timestamp with whole-second resolution.
    fn now(&self) -> NaiveDateTime;
}

/// A real clock returns the current time relative to the Unix epoch.
#[derive(Clone, Copy, Default)]
#[non_exhaustive]
pub struct RealClock {}

impl Clock for RealClock {
    fn now(&self) -> NaiveDateTime {
        // Truncate to whole seconds, so that timestamps round-trip through the datastore
        // unchanged.
        DateTime::<Utc>::from_timestamp(Utc::now().timestamp(), 0)
            .unwrap_or_default()
            .naive_utc()
    }
}

impl Debug for RealClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.now())
    }
}

/// A mock clock for use in testing. Clones are identical: all clones of a given MockClock will
/// be controlled by a controller retrieved from any of the clones.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct MockClock {
    /// The time that this clock will return from [`Self::now`].
    current_time: Arc<Mutex<NaiveDateTime>>,
}

impl MockClock {
    pub fn new(when: NaiveDateTime) -> MockClock {
        MockClock {
            current_time: Arc::new(Mutex::new(when)),
        }
    }

    pub fn set(&self, when: NaiveDateTime) {
        let mut current_time = self.current_time.lock().unwrap();
        *current_time = when;
    }

    pub fn advance(&self, dur: TimeDelta) {
        let mut current_time = self.current_time.lock().unwrap();
        *current_time += dur;
    }
}

impl Clock for MockClock {
    fn now(&self) -> NaiveDateTime {
        let current_time = self.current_time.lock().unwrap();
        *current_time
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self {
            // Sunday, September 13, 2020 12:26:40 PM UTC
            current_time: Arc::new(Mutex::new(
                DateTime::<Utc>::from_timestamp(1_600_000_000, 0)
                    .unwrap()
                    .naive_utc(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::time::{Clock, MockClock};
    use chrono::TimeDelta;

    #[test]
    fn mock_clock_advance() {
        let clock = MockClock::default();
        let start = clock.now();
        clock.advance(TimeDelta::seconds(60));
        assert_eq!(clock.now() - start, TimeDelta::seconds(60));

        // Clones share the same controller.
        let cloned = clock.clone();
        cloned.advance(TimeDelta::seconds(30));
        assert_eq!(clock.now() - start, TimeDelta::seconds(90));
    }
}
