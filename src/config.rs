//! Scheduler configuration, presets and validation

#![forbid(unsafe_code)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
use std::num::NonZeroUsize;

use thiserror::Error;

use crate::engine::CpuId;
use crate::events::{DEFAULT_EVENT_CAPACITY, EVENT_RECORD_SIZE, EventFilter};
use crate::level::DEFAULT_LEVEL_CAPACITY;
use crate::slice::{DEFAULT_HIGH_SLICE, TimeSlice};

/// Errors raised while bringing the scheduler up
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InitError {
    /// HIGH quantum is zero or unbounded
    #[error("HIGH-level quantum must be finite and non-zero, got {0}")]
    InvalidQuantum(TimeSlice),

    /// Level store cannot hold any entry
    #[error("Level store capacity must be at least 1")]
    ZeroLevelCapacity,

    /// Event ring cannot hold any event
    #[error("Event stream capacity must be at least 1")]
    ZeroEventCapacity,

    /// No execution units to shard counters over
    #[error("At least one execution unit is required")]
    NoExecutionUnits,

    /// Event filter names a unit that does not exist
    #[error("Event filter targets unit {unit} but only {units} units are configured")]
    FilterOutOfRange {
        /// Filtered unit
        unit: u32,
        /// Configured units
        units: usize,
    },
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MlfqConfig {
    /// Slice granted to HIGH-level tasks
    pub high_slice: TimeSlice,

    /// Maximum resident level entries
    pub level_capacity: usize,

    /// Event ring capacity (events)
    pub event_capacity: usize,

    /// Execution units, one counter shard each
    pub units: usize,

    /// Units allowed to publish events
    pub event_filter: EventFilter,
}

impl Default for MlfqConfig {
    fn default() -> Self {
        Self {
            high_slice: DEFAULT_HIGH_SLICE,
            level_capacity: DEFAULT_LEVEL_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            units: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            event_filter: EventFilter::AllUnits,
        }
    }
}

impl MlfqConfig {
    /// Starts a builder from the default configuration.
    #[must_use]
    pub fn builder() -> MlfqConfigBuilder {
        MlfqConfigBuilder::new()
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), InitError> {
        validate_quantum(self.high_slice)?;

        if self.level_capacity == 0 {
            return Err(InitError::ZeroLevelCapacity);
        }
        if self.event_capacity == 0 {
            return Err(InitError::ZeroEventCapacity);
        }
        if self.units == 0 {
            return Err(InitError::NoExecutionUnits);
        }
        if let EventFilter::SingleUnit(unit) = self.event_filter {
            if unit.index() >= self.units {
                return Err(InitError::FilterOutOfRange {
                    unit: unit.0,
                    units: self.units,
                });
            }
        }

        Ok(())
    }
}

pub(crate) fn validate_quantum(slice: TimeSlice) -> Result<(), InitError> {
    if slice.is_exhausted() || slice.is_infinite() {
        return Err(InitError::InvalidQuantum(slice));
    }
    Ok(())
}

/// Fluent builder for [`MlfqConfig`]
///
/// # Examples
///
/// ```
/// use mlfq_pulse::{CpuId, MlfqConfig};
///
/// let config = MlfqConfig::builder()
///     .high_slice_ms(20)
///     .units(4)
///     .trace_single_unit(CpuId(0))
///     .build()
///     .expect("valid config");
/// assert_eq!(config.high_slice.as_nanos(), 20_000_000);
/// ```
#[derive(Debug, Clone)]
pub struct MlfqConfigBuilder {
    config: MlfqConfig,
}

impl MlfqConfigBuilder {
    /// Starts from [`MlfqConfig::default`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: MlfqConfig::default(),
        }
    }

    /// Sets the HIGH-level slice.
    #[must_use]
    pub fn high_slice(mut self, slice: TimeSlice) -> Self {
        self.config.high_slice = slice;
        self
    }

    /// Sets the HIGH-level slice in milliseconds.
    #[must_use]
    pub fn high_slice_ms(mut self, ms: u64) -> Self {
        self.config.high_slice = TimeSlice::from_millis(ms);
        self
    }

    /// Sets the level store capacity.
    #[must_use]
    pub fn level_capacity(mut self, capacity: usize) -> Self {
        self.config.level_capacity = capacity;
        self
    }

    /// Sets the event ring capacity in events.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Sizes the event ring from a byte budget.
    #[must_use]
    pub fn event_ring_bytes(mut self, bytes: usize) -> Self {
        self.config.event_capacity = bytes / EVENT_RECORD_SIZE;
        self
    }

    /// Sets the number of execution units.
    #[must_use]
    pub fn units(mut self, units: usize) -> Self {
        self.config.units = units;
        self
    }

    /// Sets the event filter.
    #[must_use]
    pub fn event_filter(mut self, filter: EventFilter) -> Self {
        self.config.event_filter = filter;
        self
    }

    /// Publishes events from `unit` only.
    #[must_use]
    pub fn trace_single_unit(mut self, unit: CpuId) -> Self {
        self.config.event_filter = EventFilter::SingleUnit(unit);
        self
    }

    /// Validates and returns the configuration.
    ///
    /// # Errors
    ///
    /// Returns an [`InitError`] describing the first invalid setting.
    pub fn build(self) -> Result<MlfqConfig, InitError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for MlfqConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Predefined configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConfigProfile {
    /// 50ms quantum, every unit traced
    Standard,

    /// Standard, with events published from unit 0 only
    Cpu0Trace,

    /// 10ms quantum
    ///
    /// Best for: desktops and latency-sensitive services
    Interactive,

    /// 200ms quantum
    ///
    /// Best for: throughput-oriented batch hosts
    Batch,
}

impl ConfigProfile {
    /// Creates the profile's configuration.
    pub fn create_config(self) -> MlfqConfig {
        let base = MlfqConfig::default();
        match self {
            ConfigProfile::Standard => base,
            ConfigProfile::Cpu0Trace => MlfqConfig {
                event_filter: EventFilter::SingleUnit(CpuId(0)),
                ..base
            },
            ConfigProfile::Interactive => MlfqConfig {
                high_slice: TimeSlice::from_millis(10),
                ..base
            },
            ConfigProfile::Batch => MlfqConfig {
                high_slice: TimeSlice::from_millis(200),
                ..base
            },
        }
    }

    /// Human readable summary.
    pub fn description(self) -> &'static str {
        match self {
            ConfigProfile::Standard => {
                "50ms round-robin quantum, then FIFO. Events from every execution unit."
            },
            ConfigProfile::Cpu0Trace => {
                "50ms round-robin quantum, then FIFO. Events from execution unit 0 only."
            },
            ConfigProfile::Interactive => {
                "10ms quantum. CPU hogs reach the FIFO level quickly, keeping short tasks responsive."
            },
            ConfigProfile::Batch => {
                "200ms quantum. Fewer preemptions before tasks settle into FIFO order."
            },
        }
    }

    /// Returns all available profiles
    pub fn all_profiles() -> &'static [ConfigProfile] {
        &[
            ConfigProfile::Standard,
            ConfigProfile::Cpu0Trace,
            ConfigProfile::Interactive,
            ConfigProfile::Batch,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MlfqConfig::default();
        assert_eq!(config.high_slice, TimeSlice::from_millis(50));
        assert_eq!(config.level_capacity, 65_536);
        assert_eq!(config.event_capacity, (1 << 20) / 24);
        assert!(config.units >= 1);
        assert_eq!(config.event_filter, EventFilter::AllUnits);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = MlfqConfig::builder()
            .high_slice_ms(5)
            .level_capacity(128)
            .event_ring_bytes(24 * 16)
            .units(2)
            .build()
            .expect("valid");

        assert_eq!(config.high_slice.as_nanos(), 5_000_000);
        assert_eq!(config.level_capacity, 128);
        assert_eq!(config.event_capacity, 16);
        assert_eq!(config.units, 2);
    }

    #[test]
    fn test_validation_errors() {
        assert_eq!(
            MlfqConfig::builder().high_slice(TimeSlice::ZERO).build(),
            Err(InitError::InvalidQuantum(TimeSlice::ZERO))
        );
        assert_eq!(
            MlfqConfig::builder().high_slice(TimeSlice::INFINITE).build(),
            Err(InitError::InvalidQuantum(TimeSlice::INFINITE))
        );
        assert_eq!(
            MlfqConfig::builder().level_capacity(0).build(),
            Err(InitError::ZeroLevelCapacity)
        );
        assert_eq!(
            MlfqConfig::builder().event_ring_bytes(23).build(),
            Err(InitError::ZeroEventCapacity)
        );
        assert_eq!(MlfqConfig::builder().units(0).build(), Err(InitError::NoExecutionUnits));
        assert_eq!(
            MlfqConfig::builder().units(2).trace_single_unit(CpuId(2)).build(),
            Err(InitError::FilterOutOfRange { unit: 2, units: 2 })
        );
    }

    #[test]
    fn test_profiles() {
        for profile in ConfigProfile::all_profiles() {
            let config = profile.create_config();
            assert!(config.validate().is_ok(), "{profile:?} invalid");
            assert!(!profile.description().is_empty());
        }

        assert_eq!(
            ConfigProfile::Cpu0Trace.create_config().event_filter,
            EventFilter::SingleUnit(CpuId(0))
        );
        assert!(
            ConfigProfile::Interactive.create_config().high_slice
                < ConfigProfile::Batch.create_config().high_slice
        );
    }

    #[test]
    fn test_error_messages() {
        let err = InitError::InvalidQuantum(TimeSlice::ZERO);
        assert_eq!(err.to_string(), "HIGH-level quantum must be finite and non-zero, got 0.000ms");
    }
}
