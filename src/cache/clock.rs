//! Time source injected into the cache core.

use std::sync::Mutex;
use std::time::Duration;

use time::OffsetDateTime;

use super::lock::lock_recovered;

const SOURCE: &str = "cache::clock";

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: OffsetDateTime) {
        *lock_recovered(&self.now, SOURCE, "set") = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock_recovered(&self.now, SOURCE, "advance");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *lock_recovered(&self.now, SOURCE, "now")
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(datetime!(2024-01-01 00:00 UTC));
        clock.advance(Duration::from_millis(1_500));
        assert_eq!(clock.now(), datetime!(2024-01-01 00:00:01.5 UTC));

        clock.set(datetime!(2025-01-01 00:00 UTC));
        assert_eq!(clock.now(), datetime!(2025-01-01 00:00 UTC));
    }
}
