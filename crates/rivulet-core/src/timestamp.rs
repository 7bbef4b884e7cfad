//! Microsecond-resolution wall-clock value type
//!
//! Events dispatched by the loop are stamped with the poll-return time so
//! every callback in one cycle observes the same instant.

use core::fmt;

const MICROS_PER_SECOND: i64 = 1_000_000;

/// Microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp(i64);

impl Timestamp {
    /// An unset timestamp (epoch zero), ordered before every valid one.
    pub const fn invalid() -> Self {
        Timestamp(0)
    }

    pub const fn from_micros(us: i64) -> Self {
        Timestamp(us)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // CLOCK_REALTIME cannot fail with a valid pointer
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
        }
        Timestamp(ts.tv_sec as i64 * MICROS_PER_SECOND + ts.tv_nsec as i64 / 1_000)
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub fn micros(&self) -> i64 {
        self.0
    }

    /// Seconds between two timestamps, `self - earlier`.
    pub fn since(&self, earlier: Timestamp) -> f64 {
        (self.0 - earlier.0) as f64 / MICROS_PER_SECOND as f64
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0 / MICROS_PER_SECOND;
        let micros = self.0 % MICROS_PER_SECOND;

        // Broken-down UTC without depending on libc's tz state
        let days = secs / 86_400;
        let rem = secs % 86_400;
        let (year, month, day) = civil_from_days(days);
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            year,
            month,
            day,
            rem / 3_600,
            (rem / 60) % 60,
            rem % 60,
            micros
        )
    }
}

/// Days-since-epoch to (year, month, day), Howard Hinnant's civil algorithm.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_valid_and_monotonic_enough() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a.valid());
        assert!(b >= a);
    }

    #[test]
    fn test_invalid() {
        assert!(!Timestamp::invalid().valid());
        assert!(Timestamp::invalid() < Timestamp::now());
    }

    #[test]
    fn test_since() {
        let a = Timestamp::from_micros(1_000_000);
        let b = Timestamp::from_micros(3_500_000);
        assert!((b.since(a) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_display_epoch() {
        let t = Timestamp::from_micros(0);
        assert_eq!(format!("{}", t), "1970-01-01 00:00:00.000000");
    }

    #[test]
    fn test_display_known_instant() {
        // 2021-04-21 20:25:26 UTC
        let t = Timestamp::from_micros(1_619_036_726 * 1_000_000 + 42);
        assert_eq!(format!("{}", t), "2021-04-21 20:25:26.000042");
    }
}
