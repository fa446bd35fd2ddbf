//! Lossy event stream from the scheduler to an observer
//!
//! Demotions and LOW-level completions are published as fixed 24-byte
//! records into a bounded ring. Producers never block: when the ring is full
//! the event is dropped and counted. A single logical reader drains
//! committed events in the order they were committed.
//!
//! # Wire format
//!
//! | offset | size | field                    |
//! |--------|------|--------------------------|
//! | 0      | 8    | timestamp (ns)           |
//! | 8      | 4    | execution unit           |
//! | 12     | 4    | task id                  |
//! | 16     | 1    | kind (1 DEMOTE, 2 DONE_LOW) |
//! | 17     | 3    | zero padding             |
//!
//! Integers are little-endian.

#![forbid(unsafe_code)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;
use thiserror::Error;

use crate::engine::{CpuId, TaskId};

/// Size of one encoded event.
pub const EVENT_RECORD_SIZE: usize = 24;

/// Default ring size in bytes.
pub const DEFAULT_RING_BYTES: usize = 1 << 20;

/// Default ring capacity in events.
pub const DEFAULT_EVENT_CAPACITY: usize = DEFAULT_RING_BYTES / EVENT_RECORD_SIZE;

/// Errors decoding a wire record
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventDecodeError {
    /// Fewer than 24 bytes supplied
    #[error("Event record truncated: {len} of 24 bytes")]
    Truncated {
        /// Bytes available
        len: usize,
    },

    /// Kind byte is not a known event
    #[error("Unknown event kind: {0}")]
    UnknownKind(u8),
}

/// What happened to the task.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventKind {
    /// Task moved from HIGH to LOW.
    Demote = 1,
    /// A LOW-level task left the scheduler.
    DoneLow = 2,
}

impl EventKind {
    /// Decodes the kind byte.
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Demote),
            2 => Some(Self::DoneLow),
            _ => None,
        }
    }
}

/// Scheduling event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Event {
    /// Monotonic timestamp in nanoseconds.
    pub ts_ns: u64,
    /// Unit that produced the event.
    pub cpu: CpuId,
    /// Task the event is about.
    pub task: TaskId,
    /// Event kind.
    pub kind: EventKind,
}

/// In-memory layout of a wire record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawEvent {
    /// Timestamp in nanoseconds.
    pub ts_ns: u64,
    /// Execution unit.
    pub cpu: u32,
    /// Task id.
    pub pid: u32,
    /// Kind byte.
    pub kind: u8,
    /// Always zero.
    pub pad: [u8; 3],
}

/* Compile-time size verification */
const _: () = {
    assert!(std::mem::size_of::<RawEvent>() == EVENT_RECORD_SIZE);
};

impl From<Event> for RawEvent {
    fn from(event: Event) -> Self {
        Self {
            ts_ns: event.ts_ns,
            cpu: event.cpu.0,
            pid: event.task.0,
            kind: event.kind as u8,
            pad: [0; 3],
        }
    }
}

impl TryFrom<RawEvent> for Event {
    type Error = EventDecodeError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let kind = EventKind::from_u8(raw.kind).ok_or(EventDecodeError::UnknownKind(raw.kind))?;
        Ok(Self {
            ts_ns: raw.ts_ns,
            cpu: CpuId(raw.cpu),
            task: TaskId(raw.pid),
            kind,
        })
    }
}

impl Event {
    /// Encodes the 24-byte wire record.
    #[must_use]
    pub fn encode(&self) -> [u8; EVENT_RECORD_SIZE] {
        let mut buf = [0u8; EVENT_RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.ts_ns.to_le_bytes());
        buf[8..12].copy_from_slice(&self.cpu.0.to_le_bytes());
        buf[12..16].copy_from_slice(&self.task.0.to_le_bytes());
        buf[16] = self.kind as u8;
        buf
    }

    /// Decodes a wire record from the first 24 bytes of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is short or the kind is unknown.
    pub fn decode(bytes: &[u8]) -> Result<Self, EventDecodeError> {
        if bytes.len() < EVENT_RECORD_SIZE {
            return Err(EventDecodeError::Truncated { len: bytes.len() });
        }

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[0..8]);
        let mut cpu = [0u8; 4];
        cpu.copy_from_slice(&bytes[8..12]);
        let mut pid = [0u8; 4];
        pid.copy_from_slice(&bytes[12..16]);

        Event::try_from(RawEvent {
            ts_ns: u64::from_le_bytes(ts),
            cpu: u32::from_le_bytes(cpu),
            pid: u32::from_le_bytes(pid),
            kind: bytes[16],
            pad: [0; 3],
        })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EventKind::Demote => write!(f, "DEMOTE pid={} -> LO", self.task.0),
            EventKind::DoneLow => write!(f, "DONE_LO pid={}", self.task.0),
        }
    }
}

/// Which units may publish events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventFilter {
    /// Every unit publishes.
    #[default]
    AllUnits,
    /// Only the given unit publishes.
    SingleUnit(CpuId),
}

impl EventFilter {
    /// Whether events from `cpu` pass the filter.
    #[inline]
    pub fn admits(&self, cpu: CpuId) -> bool {
        match self {
            Self::AllUnits => true,
            Self::SingleUnit(unit) => *unit == cpu,
        }
    }
}

/// Bounded multi-producer event ring.
#[derive(Debug)]
pub struct EventStream {
    ring: ArrayQueue<Event>,
    filter: EventFilter,
    emitted: AtomicU64,
    dropped: AtomicU64,
    filtered: AtomicU64,
}

impl EventStream {
    /// Creates a ring holding up to `capacity` events (minimum 1).
    #[must_use]
    pub fn new(capacity: usize, filter: EventFilter) -> Self {
        Self {
            ring: ArrayQueue::new(capacity.max(1)),
            filter,
            emitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
        }
    }

    /// Creates a ring sized like a `bytes`-long record buffer.
    #[must_use]
    pub fn with_ring_bytes(bytes: usize, filter: EventFilter) -> Self {
        Self::new(bytes / EVENT_RECORD_SIZE, filter)
    }

    /// Publishes `event` without blocking.
    ///
    /// Returns `false` when the event was filtered out or the ring was full.
    #[inline]
    pub fn emit(&self, event: Event) -> bool {
        if !self.filter.admits(event.cpu) {
            self.filtered.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        match self.ring.push(event) {
            Ok(()) => {
                self.emitted.fetch_add(1, Ordering::Relaxed);
                true
            },
            Err(_lost) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);

                #[cfg(feature = "tracing")]
                tracing::trace!(task_id = ?_lost.task, kind = ?_lost.kind, "Event ring full, event dropped");

                false
            },
        }
    }

    /// Hands every currently committed event to `handler`, oldest first.
    ///
    /// Events committed while polling are left for the next call.
    pub fn poll<F>(&self, mut handler: F) -> usize
    where
        F: FnMut(&Event),
    {
        let delivered = self.try_poll(|event| {
            handler(event);
            Ok::<(), Infallible>(())
        });
        match delivered {
            Ok(delivered) => delivered,
            Err(never) => match never {},
        }
    }

    /// Like [`EventStream::poll`], but stops at the first handler error.
    ///
    /// The event the handler failed on is consumed; later events stay
    /// queued for the next call.
    ///
    /// # Errors
    ///
    /// Returns the handler's error.
    pub fn try_poll<F, E>(&self, mut handler: F) -> Result<usize, E>
    where
        F: FnMut(&Event) -> Result<(), E>,
    {
        let available = self.ring.len();
        let mut delivered = 0;

        while delivered < available {
            let Some(event) = self.ring.pop() else {
                break;
            };
            handler(&event)?;
            delivered += 1;
        }

        Ok(delivered)
    }

    /// Removes and returns every currently committed event.
    pub fn drain(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.ring.len());
        self.poll(|event| events.push(*event));
        events
    }

    /// Events waiting to be read.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether no events are waiting.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Ring capacity in events.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Active unit filter.
    pub fn filter(&self) -> EventFilter {
        self.filter
    }

    /// Events committed to the ring.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Events lost to a full ring.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events suppressed by the unit filter.
    pub fn filtered(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }
}
