/*
 * time.rs
 *
 * Second/microsecond time values and the reactor clock.
 *
 * All timer math runs on TimeVal, a normalized (sec, usec) pair ordered
 * as a tuple. The reactor probes CLOCK_MONOTONIC once at startup; when
 * it is available every deadline is monotonic and backward wall-clock
 * jumps cannot happen. Without it we fall back to gettimeofday and the
 * dispatch loop rebases pending deadlines when the wall clock moves
 * backwards.
 *
 * Why saturating rather than wrapping arithmetic: a deadline overshoot
 * is normal (timer already expired), so differences clamp to zero
 * instead of producing a bogus 68-year timeout.
 */

use core::time::Duration;

use crate::error::{EventError, Result, errno};

const USEC_PER_SEC: i64 = 1_000_000;

/// A second/microsecond instant or interval.
///
/// Ordered lexicographically on `(sec, usec)`. Values produced by this
/// crate are always normalized (`0 <= usec < 1_000_000`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeVal {
    pub sec: i64,
    pub usec: i64,
}

impl TimeVal {
    pub const ZERO: TimeVal = TimeVal { sec: 0, usec: 0 };

    #[inline]
    #[must_use]
    pub fn new(sec: i64, usec: i64) -> Self {
        TimeVal { sec, usec }.normalized()
    }

    /* fold usec into [0, 1_000_000) with carry into sec */
    fn normalized(self) -> Self {
        let mut sec = self.sec.saturating_add(self.usec.div_euclid(USEC_PER_SEC));
        let mut usec = self.usec.rem_euclid(USEC_PER_SEC);
        if sec < 0 {
            /* negative results clamp to zero - a deadline in the past is "now" */
            sec = 0;
            usec = 0;
        }
        TimeVal { sec, usec }
    }

    #[inline]
    #[must_use]
    pub fn is_zero(self) -> bool {
        self.sec == 0 && self.usec == 0
    }

    /// The C `timeradd`: saturating, normalized.
    #[inline]
    #[must_use]
    pub fn add(self, other: TimeVal) -> TimeVal {
        TimeVal {
            sec: self.sec.saturating_add(other.sec),
            usec: self.usec + other.usec,
        }
        .normalized()
    }

    /// The C `timersub`, clamped at zero: overshooting a deadline is
    /// expected, not a bug.
    #[inline]
    #[must_use]
    pub fn sub(self, other: TimeVal) -> TimeVal {
        TimeVal {
            sec: self.sec.saturating_sub(other.sec),
            usec: self.usec - other.usec,
        }
        .normalized()
    }

    #[must_use]
    pub fn from_duration(d: Duration) -> TimeVal {
        let sec = i64::try_from(d.as_secs()).unwrap_or(i64::MAX);
        TimeVal {
            sec,
            usec: i64::from(d.subsec_micros()),
        }
        .normalized()
    }

    #[must_use]
    pub fn to_duration(self) -> Duration {
        Duration::new(self.sec.max(0) as u64, (self.usec.max(0) as u32) * 1000)
    }

    /* milliseconds for the kernel wait, rounding partial ms up so we never
     * wake before the deadline */
    #[inline]
    pub(crate) fn to_millis_ceil(self) -> i64 {
        self.sec
            .saturating_mul(1000)
            .saturating_add((self.usec + 999) / 1000)
    }
}

/// The reactor clock. Monotonic support is probed exactly once, at
/// construction; the answer never changes for the lifetime of the base.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    monotonic: bool,
}

impl Clock {
    pub(crate) fn detect() -> Clock {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: ts is a valid timespec; clock_gettime only writes it.
        let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &raw mut ts) };
        Clock { monotonic: ret == 0 }
    }

    #[inline]
    pub(crate) fn monotonic(self) -> bool {
        self.monotonic
    }

    /// Current time on the timer timescale: monotonic when available,
    /// wall otherwise.
    pub(crate) fn now(self) -> Result<TimeVal> {
        if self.monotonic {
            let mut ts = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            // SAFETY: ts is a valid timespec; clock_gettime only writes it.
            if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &raw mut ts) } == -1 {
                let e = errno();
                log::error!("clock_gettime failed, errno = {e}");
                return Err(EventError::Clock(e));
            }
            return Ok(TimeVal::new(i64::from(ts.tv_sec), i64::from(ts.tv_nsec) / 1000));
        }
        Self::wall()
    }

    /// Wall-clock time, always via gettimeofday. Used to translate a
    /// monotonic deadline into something a caller can compare to real
    /// time (see `EventBase::pending`).
    pub(crate) fn wall() -> Result<TimeVal> {
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        // SAFETY: tv is a valid timeval; the timezone argument may be null.
        if unsafe { libc::gettimeofday(&raw mut tv, core::ptr::null_mut()) } == -1 {
            let e = errno();
            log::error!("gettimeofday failed, errno = {e}");
            return Err(EventError::Clock(e));
        }
        Ok(TimeVal::new(i64::from(tv.tv_sec), i64::from(tv.tv_usec)))
    }

    #[cfg(test)]
    pub(crate) fn force_wall(&mut self) {
        self.monotonic = false;
    }
}
