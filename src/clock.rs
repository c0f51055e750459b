use std::fmt::Debug;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Time source for the engine.
///
/// `now` is wall-clock time and is only used for timestamps that get
/// persisted. `elapsed` is monotonic and drives every timeout, so adjusting
/// the system clock never fires or delays an expiry.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;

    fn elapsed(&self) -> Duration;
}

#[derive(Debug)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    start: DateTime<Utc>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *offset += by;
    }

    fn offset(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.offset())
            .map(|offset| self.start + offset)
            .unwrap_or(self.start)
    }

    fn elapsed(&self) -> Duration {
        self.offset()
    }
}

#[test]
fn manual_clock_moves_both_time_sources() {
    let start = Utc::now();
    let clock = ManualClock::new(start);

    assert_eq!(clock.now(), start);
    assert_eq!(clock.elapsed(), Duration::ZERO);

    clock.advance(Duration::from_secs(90));

    assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    assert_eq!(clock.elapsed(), Duration::from_secs(90));
}
