use std::ops::{Add, Sub};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

/// Process-wide monotonic epoch. All `TimeValue`s are measured from here,
/// so they compare consistently across threads.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

const USEC_PER_SEC: i32 = 1_000_000;

/// A (seconds, microseconds) timestamp on the process monotonic clock.
///
/// Kept normalized with `0 <= usec < 1_000_000`; the seconds field may go
/// negative, so differences of timestamps (overdue deadlines included) are
/// representable.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Debug)]
pub struct TimeValue {
    sec: i64,
    usec: i32,
}

impl TimeValue {
    pub const ZERO: TimeValue = TimeValue { sec: 0, usec: 0 };

    pub fn now() -> TimeValue {
        TimeValue::from_duration(EPOCH.elapsed())
    }

    pub fn from_duration(d: Duration) -> TimeValue {
        TimeValue {
            sec: d.as_secs() as i64,
            usec: d.subsec_micros() as i32,
        }
    }

    fn normalize(sec: i64, usec: i64) -> TimeValue {
        let mut sec = sec + usec / USEC_PER_SEC as i64;
        let mut usec = (usec % USEC_PER_SEC as i64) as i32;
        if usec < 0 {
            // borrow from the seconds field
            usec += USEC_PER_SEC;
            sec -= 1;
        }
        TimeValue { sec, usec }
    }

    /// Offset by a fractional number of seconds (negative is legal).
    pub fn add_secs(self, secs: f64) -> TimeValue {
        let whole = secs.trunc() as i64;
        let frac = ((secs - secs.trunc()) * USEC_PER_SEC as f64).round() as i64;
        TimeValue::normalize(self.sec + whole, self.usec as i64 + frac)
    }

    /// Fractional seconds from `other` to `self`; negative when `self`
    /// is earlier (i.e. the deadline is overdue).
    pub fn delta(self, other: TimeValue) -> f64 {
        let sec = self.sec - other.sec;
        let usec = self.usec - other.usec;
        sec as f64 + usec as f64 * 1.0e-6
    }

    /// Time remaining until `self`, clamped to zero once due.
    pub fn remaining(self, now: TimeValue) -> Duration {
        let delta = self.delta(now);
        if delta <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(delta)
        }
    }
}

impl Add<Duration> for TimeValue {
    type Output = TimeValue;

    fn add(self, rhs: Duration) -> TimeValue {
        TimeValue::normalize(
            self.sec + rhs.as_secs() as i64,
            self.usec as i64 + rhs.subsec_micros() as i64,
        )
    }
}

impl Sub for TimeValue {
    type Output = f64;

    fn sub(self, rhs: TimeValue) -> f64 {
        self.delta(rhs)
    }
}
