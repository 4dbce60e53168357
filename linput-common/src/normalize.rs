//! Conversion of kernel timestamps and key codes into the consumer's conventions.
//!
//! The consumer expects Windows-style file times and PS/2 set-1 scan codes, with
//! extended keys in the `0xE0xx` range. Values here must match the consumer bit
//! for bit.

use crate::{DeviceTime, RawEvent, WireEvent, EV_KEY, KEY_AUTOREPEAT};

/// Seconds between 1601-01-01 and 1970-01-01.
pub const EPOCH_OFFSET_SECONDS: i64 = 11_644_473_600;

/// 100ns ticks per second.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Added to every code coming from a device that reports relative motion.
pub const MOUSE_CODE_OFFSET: u16 = 0x3000;

const EXTENDED_FIRST: u16 = 97;
const EXTENDED_LAST: u16 = 115;

/// Convert a device timestamp to 100ns ticks since 1601-01-01.
///
/// Arithmetic wraps instead of panicking on out-of-range input.
pub fn convert_time(time: DeviceTime) -> i64 {
    time.secs
        .wrapping_add(EPOCH_OFFSET_SECONDS)
        .wrapping_mul(TICKS_PER_SECOND)
        .wrapping_add(time.micros.wrapping_mul(10))
}

/// Map a keyboard code into the extended scan-code space.
///
/// Codes 97..=115 are remapped. The reserved ones without an extended
/// equivalent map to 0; codes outside the range pass through unchanged.
pub fn convert_scan_code(code: u16) -> u16 {
    if !(EXTENDED_FIRST..=EXTENDED_LAST).contains(&code) {
        return code;
    }

    match code {
        97 => 0xE01D,  // RIGHTCTRL
        98 => 0xE035,  // KPSLASH
        100 => 0xE038, // RIGHTALT
        102 => 0xE047, // HOME
        103 => 0xE048, // UP
        104 => 0xE049, // PAGEUP
        105 => 0xE04B, // LEFT
        106 => 0xE04D, // RIGHT
        107 => 0xE04F, // END
        108 => 0xE050, // DOWN
        109 => 0xE051, // PAGEDOWN
        110 => 0xE052, // INSERT
        111 => 0xE053, // DELETE
        113 => 0xE020, // MUTE
        114 => 0xE02E, // VOLUMEDOWN
        115 => 0xE030, // VOLUMEUP
        // SYSRQ, LINEFEED, MACRO
        _ => 0,
    }
}

/// Translate a code for the device class it came from.
pub fn translate_code(code: u16, pointer: bool) -> u16 {
    if pointer {
        code.wrapping_add(MOUSE_CODE_OFFSET)
    } else {
        convert_scan_code(code)
    }
}

/// Build the wire record for a raw event, or `None` if the event is not forwarded.
///
/// Only key events are forwarded, and autorepeats are dropped.
pub fn to_wire(event: &RawEvent, pointer: bool) -> Option<WireEvent> {
    if event.kind != EV_KEY || event.value == KEY_AUTOREPEAT {
        return None;
    }

    Some(WireEvent {
        time: convert_time(event.time),
        kind: event.kind,
        code: translate_code(event.code, pointer),
        value: event.value,
    })
}
