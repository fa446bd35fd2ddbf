//! Timestamp sources for scheduling events
//!
//! Events carry a monotonic nanosecond timestamp taken at the moment the
//! decision engine makes a transition. The engine reads time through the
//! [`Clock`] trait so hosts can plug in the kernel's monotonic clock, a
//! portable fallback, or a hand-driven clock for deterministic simulation.
//!
//! # Platform Support
//!
//! - **Linux**: `clock_gettime(CLOCK_MONOTONIC)`, nanosecond resolution
//! - **Fallback**: `std::time::Instant` measured from clock creation
//! - **Manual**: [`ManualClock`], advanced explicitly by the caller
//!
//! # Example
//!
//! ```rust
//! use mlfq_pulse::timing::{create_clock, Clock};
//!
//! let clock = create_clock();
//! let a = clock.now_ns();
//! let b = clock.now_ns();
//! assert!(b >= a);
//! println!("Using clock: {}", clock.name());
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

mod fallback;
#[cfg(target_os = "linux")]
mod linux;

pub use fallback::InstantClock;
#[cfg(target_os = "linux")]
pub use linux::MonotonicClock;

/// Errors raised while setting up a clock source
#[derive(Debug, Error)]
pub enum ClockError {
    /// System call failed
    #[error("System call failed: {0}")]
    SystemCallFailed(#[from] std::io::Error),
}

/// Monotonic nanosecond time source.
///
/// Reads never fail and never go backwards for a single clock instance.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in nanoseconds.
    fn now_ns(&self) -> u64;

    /// Name of the backing implementation.
    fn name(&self) -> &'static str;
}

/// Creates the most precise clock available on this platform
#[must_use]
pub fn create_clock() -> Arc<dyn Clock> {
    #[cfg(target_os = "linux")]
    {
        monotonic_or_fallback(MonotonicClock::new())
    }

    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(InstantClock::new())
    }
}

#[cfg(target_os = "linux")]
fn monotonic_or_fallback(clock: Result<MonotonicClock, ClockError>) -> Arc<dyn Clock> {
    match clock {
        Ok(clock) => Arc::new(clock),
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_e, "CLOCK_MONOTONIC unavailable, event timestamps fall back to Instant");

            Arc::new(InstantClock::new())
        },
    }
}

/// Clock advanced by hand, for simulation and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `start_ns`.
    #[must_use]
    pub fn new(start_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(start_ns),
        }
    }

    /// Moves the clock forward by `delta_ns`, returning the new reading.
    pub fn advance(&self, delta_ns: u64) -> u64 {
        self.now_ns.fetch_add(delta_ns, Ordering::AcqRel).saturating_add(delta_ns)
    }

    /// Sets the reading, ignoring attempts to move backwards.
    pub fn set(&self, now_ns: u64) {
        self.now_ns.fetch_max(now_ns, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::Acquire)
    }

    fn name(&self) -> &'static str {
        "Manual"
    }
}
