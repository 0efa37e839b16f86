//!
//! Deadline Conversion
//!
//! naml passes durations as seconds, either an `int` or a `float`. Timed
//! waits take an absolute deadline on `CLOCK_REALTIME`, which is the clock
//! `pthread_mutex_timedlock` measures against. The deadline is computed once
//! per call; retries inside a wait loop compare against the same instant.
//!

use std::time::Duration;

pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A relative duration in seconds as received from naml code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Seconds {
    Whole(i64),
    Fractional(f64),
}

impl From<i64> for Seconds {
    fn from(secs: i64) -> Self {
        Seconds::Whole(secs)
    }
}

impl From<f64> for Seconds {
    fn from(secs: f64) -> Self {
        Seconds::Fractional(secs)
    }
}

/// An absolute wall-clock instant, seconds and nanoseconds since the epoch.
///
/// `nanos` is always in `[0, NANOS_PER_SEC)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    secs: i64,
    nanos: i64,
}

impl Deadline {
    pub fn new(secs: i64, nanos: i64) -> Self {
        let mut deadline = Deadline { secs, nanos: 0 };
        deadline.add_nanos(nanos);
        deadline
    }

    /// The current `CLOCK_REALTIME` time.
    pub fn now() -> Self {
        // clock_gettime cannot fail for CLOCK_REALTIME with a valid pointer.
        let ts = unsafe {
            let mut ts: libc::timespec = std::mem::zeroed();
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
            ts
        };
        Deadline::new(ts.tv_sec as i64, ts.tv_nsec as i64)
    }

    /// Converts an optional timeout into a deadline measured from the
    /// current time. `None` means wait forever.
    pub fn from_timeout(timeout: Option<Seconds>) -> Option<Deadline> {
        timeout.map(|secs| Deadline::after(Deadline::now(), secs))
    }

    /// `now + secs`, normalized.
    ///
    /// Fractional input keeps nanosecond precision: the whole part is
    /// truncated toward zero and the remainder is rounded to the nearest
    /// nanosecond, so a negative remainder borrows a second. Out-of-range
    /// values saturate; NaN contributes nothing.
    pub fn after(now: Deadline, secs: Seconds) -> Deadline {
        match secs {
            Seconds::Whole(n) => Deadline {
                secs: now.secs.saturating_add(n),
                nanos: now.nanos,
            },
            Seconds::Fractional(f) => {
                let whole = f.trunc();
                let part = f - whole;
                let mut deadline = Deadline {
                    secs: now.secs.saturating_add(whole as i64),
                    nanos: now.nanos,
                };
                deadline.add_nanos((part * 1e9).round() as i64);
                deadline
            }
        }
    }

    fn add_nanos(&mut self, nanos: i64) {
        let total = self.nanos + nanos;
        self.secs = self.secs.saturating_add(total.div_euclid(NANOS_PER_SEC));
        self.nanos = total.rem_euclid(NANOS_PER_SEC);
    }

    pub fn secs(&self) -> i64 {
        self.secs
    }

    pub fn subsec_nanos(&self) -> i64 {
        self.nanos
    }

    pub fn to_timespec(&self) -> libc::timespec {
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        ts.tv_sec = self.secs as libc::time_t;
        ts.tv_nsec = self.nanos as _;
        ts
    }

    /// Time left until the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.remaining_from(Deadline::now())
    }

    fn remaining_from(&self, now: Deadline) -> Duration {
        if *self <= now {
            return Duration::ZERO;
        }
        let mut secs = self.secs - now.secs;
        let mut nanos = self.nanos - now.nanos;
        if nanos < 0 {
            secs -= 1;
            nanos += NANOS_PER_SEC;
        }
        Duration::new(secs as u64, nanos as u32)
    }
}

/// Suspend the calling thread. Non-positive durations return immediately.
pub fn sleep(secs: Seconds) {
    let duration = match secs {
        Seconds::Whole(n) if n > 0 => Duration::from_secs(n as u64),
        Seconds::Fractional(f) if f > 0.0 => {
            Duration::try_from_secs_f64(f).unwrap_or(Duration::MAX)
        }
        _ => return,
    };
    std::thread::sleep(duration);
}
