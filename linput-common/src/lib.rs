//! Shared contract between `linputd` and the process that consumes its events.
//!
//! The consumer owns a fixed array of [`WireEvent`] records in shared memory.
//! `linputd` fills the first slot whose type is [`EVENT_EMPTY`]; the consumer
//! drains slots and resets them to empty. Both sides must hold the same named
//! lock while touching the array.

use serde::{Deserialize, Serialize};
use std::fmt;

// Re-export common dependencies
pub use serde;
pub use tracing;

pub mod keys;
pub mod normalize;

/// Number of records in the shared channel.
pub const SLOT_COUNT: usize = 20;

/// Type value marking an unused slot.
pub const EVENT_EMPTY: u16 = 0;

/// Type value written into slot 0 when no input device could be opened.
pub const EVENT_NO_DEVICES: u16 = 3;

/// Linux event classes the pipeline cares about.
pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;

/// Key event value reported for autorepeat.
pub const KEY_AUTOREPEAT: i32 = 2;

/// Seconds+microseconds timestamp as reported by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceTime {
    pub secs: i64,
    pub micros: i64,
}

impl DeviceTime {
    pub fn new(secs: i64, micros: i64) -> Self {
        Self { secs, micros }
    }
}

/// One event as read from a device, before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub time: DeviceTime,
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

/// Fixed 16-byte record stored in each slot of the shared channel.
///
/// `time` is in 100ns ticks since 1601-01-01 UTC.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    pub time: i64,
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

const _: () = assert!(std::mem::size_of::<WireEvent>() == 16);

impl WireEvent {
    pub fn is_empty(&self) -> bool {
        self.kind == EVENT_EMPTY
    }
}

impl fmt::Display for WireEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "type={} code={:#06X} value={} time={}",
               self.kind, self.code, self.value, self.time)
    }
}

/// Indexed access to the slot array.
///
/// Implementations backed by memory shared with another process must only be
/// touched while that process's lock is held.
pub trait SlotStore {
    fn capacity(&self) -> usize;

    fn read(&self, index: usize) -> WireEvent;

    fn write(&mut self, index: usize, record: WireEvent);

    /// Overwrite only the type field of a slot.
    fn write_kind(&mut self, index: usize, kind: u16);

    /// Index of the lowest empty slot, if any.
    fn first_empty(&self) -> Option<usize> {
        (0..self.capacity()).find(|&i| self.read(i).is_empty())
    }
}

impl SlotStore for Vec<WireEvent> {
    fn capacity(&self) -> usize {
        self.len()
    }

    fn read(&self, index: usize) -> WireEvent {
        self[index]
    }

    fn write(&mut self, index: usize, record: WireEvent) {
        self[index] = record;
    }

    fn write_kind(&mut self, index: usize, kind: u16) {
        self[index].kind = kind;
    }
}
