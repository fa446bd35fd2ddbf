#![forbid(unsafe_code)]

/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */
/* Time slice accounting for dispatched tasks */
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Nanoseconds per millisecond.
pub const NS_PER_MS: u64 = 1_000_000;

/// Default HIGH-level quantum.
pub const DEFAULT_HIGH_SLICE: TimeSlice = TimeSlice::from_millis(50);

/// CPU time granted to a task per dispatch, in nanoseconds.
///
/// [`TimeSlice::INFINITE`] means the task keeps the CPU until it blocks,
/// exits or is preempted by a higher scheduling class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeSlice(u64);

impl TimeSlice {
    /// Unbounded slice.
    pub const INFINITE: Self = Self(u64::MAX);

    /// Fully consumed slice.
    pub const ZERO: Self = Self(0);

    /// Slice of `ns` nanoseconds.
    #[inline]
    #[must_use]
    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    /// Slice of `ms` milliseconds, saturating to infinite.
    #[inline]
    #[must_use]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms.saturating_mul(NS_PER_MS))
    }

    /// Length in nanoseconds.
    #[inline]
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Whether this is the unbounded slice.
    #[inline]
    #[must_use]
    pub const fn is_infinite(self) -> bool {
        self.0 == u64::MAX
    }

    /// Whether nothing is left of the slice.
    #[inline]
    #[must_use]
    pub const fn is_exhausted(self) -> bool {
        self.0 == 0
    }
}

impl From<Duration> for TimeSlice {
    fn from(duration: Duration) -> Self {
        Self(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX))
    }
}

impl fmt::Display for TimeSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            f.write_str("inf")
        } else {
            write!(f, "{:.3}ms", self.0 as f64 / NS_PER_MS as f64)
        }
    }
}

/// Remaining slice of a running task, charged by the host as it executes.
#[repr(C, align(16))]
#[derive(Debug)]
pub struct SliceBudget {
    remaining_ns: AtomicU64, /* Left in the current slice */

    granted_ns: AtomicU64, /* Slice at last dispatch */
}

/* Compile-time size verification */
const _: () = {
    assert!(std::mem::size_of::<SliceBudget>() == 16);
    assert!(std::mem::align_of::<SliceBudget>() == 16);
};

impl SliceBudget {
    /// Creates a budget holding `slice`.
    #[inline]
    #[must_use]
    pub fn new(slice: TimeSlice) -> Self {
        Self {
            remaining_ns: AtomicU64::new(slice.as_nanos()),
            granted_ns: AtomicU64::new(slice.as_nanos()),
        }
    }

    /// Charges `ns` of execution.
    ///
    /// Returns `true` once the slice is exhausted. An infinite slice is
    /// never charged.
    #[inline]
    pub fn consume(&self, ns: u64) -> bool {
        let charged = self.remaining_ns.fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
            (left != u64::MAX).then(|| left.saturating_sub(ns))
        });

        match charged {
            Ok(previous) => previous <= ns,
            Err(_) => false,
        }
    }

    /// Checks if the slice is exhausted without charging.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.remaining_ns.load(Ordering::Acquire) == 0
    }

    /// Grants a fresh slice.
    #[inline]
    pub fn reset(&self, slice: TimeSlice) {
        self.granted_ns.store(slice.as_nanos(), Ordering::Relaxed);
        self.remaining_ns.store(slice.as_nanos(), Ordering::Release);
    }

    /// Returns what is left of the slice.
    #[inline]
    pub fn remaining(&self) -> TimeSlice {
        TimeSlice::from_nanos(self.remaining_ns.load(Ordering::Acquire))
    }

    /// Returns the slice granted at the last reset.
    #[inline]
    pub fn granted(&self) -> TimeSlice {
        TimeSlice::from_nanos(self.granted_ns.load(Ordering::Relaxed))
    }

    /// Returns how much of the granted slice has been charged.
    #[inline]
    pub fn used_ns(&self) -> u64 {
        let granted = self.granted_ns.load(Ordering::Relaxed);
        if granted == u64::MAX {
            return 0;
        }
        granted.saturating_sub(self.remaining_ns.load(Ordering::Acquire))
    }
}

impl Default for SliceBudget {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_SLICE)
    }
}
