#![allow(unsafe_code)] // clock_gettime requires unsafe

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Linux monotonic time via clock_gettime
use libc::{CLOCK_MONOTONIC, clock_gettime, timespec};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Clock, ClockError};

/// `CLOCK_MONOTONIC` clock, the same base the kernel stamps events with.
#[derive(Debug)]
pub struct MonotonicClock {
    // Last successful reading
    last_ns: AtomicU64,
}

impl MonotonicClock {
    /// Creates the clock after verifying `clock_gettime` works.
    ///
    /// # Errors
    ///
    /// Returns an error if the system call fails.
    pub fn new() -> Result<Self, ClockError> {
        let now = Self::read_raw()?;
        Ok(Self {
            last_ns: AtomicU64::new(now),
        })
    }

    #[inline]
    fn read_raw() -> Result<u64, ClockError> {
        let mut ts = timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        // SAFETY: Valid timespec and clock ID
        let ret = unsafe { clock_gettime(CLOCK_MONOTONIC, &mut ts) };

        if ret == 0 {
            let secs_ns = (ts.tv_sec as u64).saturating_mul(1_000_000_000);
            Ok(secs_ns.saturating_add(ts.tv_nsec as u64))
        } else {
            Err(ClockError::SystemCallFailed(std::io::Error::last_os_error()))
        }
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        match Self::read_raw() {
            Ok(now) => {
                let prev = self.last_ns.fetch_max(now, Ordering::AcqRel);
                prev.max(now)
            },
            // Repeat the last reading
            Err(_) => self.last_ns.load(Ordering::Acquire),
        }
    }

    fn name(&self) -> &'static str {
        "Linux (clock_gettime CLOCK_MONOTONIC)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_creation() {
        let clock = MonotonicClock::new();
        assert!(clock.is_ok(), "Failed to create clock: {:?}", clock.err());
    }

    #[test]
    fn test_monotonicity() {
        let clock = MonotonicClock::new().expect("clock");
        let mut previous = clock.now_ns();

        for _ in 0..1000 {
            let current = clock.now_ns();
            assert!(current >= previous, "Time went backwards: {} < {}", current, previous);
            previous = current;
        }
    }

    #[test]
    fn test_advances_across_sleep() {
        let clock = MonotonicClock::new().expect("clock");
        let start = clock.now_ns();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let end = clock.now_ns();
        assert!(end - start >= 1_000_000, "Time difference too small: {} ns", end - start);
    }

    #[test]
    fn test_name() {
        let clock = MonotonicClock::new().expect("clock");
        assert!(clock.name().contains("CLOCK_MONOTONIC"));
    }
}
