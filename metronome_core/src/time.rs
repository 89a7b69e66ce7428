//! Logical time as a signed fixed-point count of nanoseconds.
//!
//! The representation matches what the timing protocol needs: exact integer
//! arithmetic (no drift on repeated period addition), a `MAXTIME` sentinel
//! that saturates instead of overflowing, and an epsilon of one nanosecond.

use std::{fmt::Display, time::Duration};

use serde::{Deserialize, Serialize};

const NS_PER_SEC: i64 = 1_000_000_000;

/// A logical simulation time, counted in nanoseconds from the federation
/// origin.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Time(i64);

impl Time {
    pub const ZERO: Time = Time(0);
    /// Smallest representable time increment.
    pub const EPSILON: Time = Time(1);
    /// Sentinel for "no event will ever occur" / +∞.
    pub const MAXTIME: Time = Time(i64::MAX);
    /// Sentinel for "before any valid time" / -∞.
    pub const MINTIME: Time = Time(i64::MIN);

    pub const fn from_ns(ns: i64) -> Self {
        Time(ns)
    }

    pub const fn from_millis(ms: i64) -> Self {
        Time(ms * 1_000_000)
    }

    pub const fn from_secs(secs: i64) -> Self {
        Time(secs * NS_PER_SEC)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        if secs >= i64::MAX as f64 / NS_PER_SEC as f64 {
            return Time::MAXTIME;
        }
        Time((secs * NS_PER_SEC as f64).round() as i64)
    }

    pub const fn as_ns(self) -> i64 {
        self.0
    }

    pub fn to_secs_f64(self) -> f64 {
        self.0 as f64 / NS_PER_SEC as f64
    }

    pub const fn is_max(self) -> bool {
        self.0 == i64::MAX
    }

    /// Integer division by another time quantity, rounding toward +∞.
    ///
    /// Used for projecting times onto a period grid.
    pub fn div_ceil(self, rhs: Time) -> i64 {
        debug_assert!(rhs.0 > 0);
        let q = self.0 / rhs.0;
        if self.0 % rhs.0 > 0 {
            q + 1
        } else {
            q
        }
    }

    pub fn min(self, other: Time) -> Time {
        Time(self.0.min(other.0))
    }

    pub fn max(self, other: Time) -> Time {
        Time(self.0.max(other.0))
    }
}

impl From<Duration> for Time {
    fn from(d: Duration) -> Self {
        Time(d.as_nanos().min(i64::MAX as u128) as i64)
    }
}

impl std::ops::Add for Time {
    type Output = Time;

    fn add(self, rhs: Time) -> Time {
        // MAXTIME is absorbing so "no event" never wraps into the past.
        if self.is_max() || rhs.is_max() {
            Time::MAXTIME
        } else {
            Time(self.0.saturating_add(rhs.0))
        }
    }
}

impl std::ops::AddAssign for Time {
    fn add_assign(&mut self, rhs: Time) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub for Time {
    type Output = Time;

    fn sub(self, rhs: Time) -> Time {
        if self.is_max() {
            Time::MAXTIME
        } else {
            Time(self.0.saturating_sub(rhs.0))
        }
    }
}

impl std::ops::Mul<i64> for Time {
    type Output = Time;

    fn mul(self, rhs: i64) -> Time {
        if self.is_max() {
            Time::MAXTIME
        } else {
            Time(self.0.saturating_mul(rhs))
        }
    }
}

impl Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_max() {
            write!(f, "maxtime")
        } else if self.0 == i64::MIN {
            write!(f, "mintime")
        } else {
            write!(f, "{}s", self.to_secs_f64())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maxtime_is_absorbing() {
        assert_eq!(Time::MAXTIME + Time::from_secs(5), Time::MAXTIME);
        assert_eq!(Time::from_secs(5) + Time::MAXTIME, Time::MAXTIME);
        assert_eq!(Time::MAXTIME - Time::from_secs(5), Time::MAXTIME);
    }

    #[test]
    fn seconds_round_trip() {
        let t = Time::from_secs_f64(1.5);
        assert_eq!(t.as_ns(), 1_500_000_000);
        assert_eq!(t.to_secs_f64(), 1.5);
    }

    #[test]
    fn div_ceil_rounds_up() {
        assert_eq!(Time::from_ns(10).div_ceil(Time::from_ns(4)), 3);
        assert_eq!(Time::from_ns(8).div_ceil(Time::from_ns(4)), 2);
    }
}
