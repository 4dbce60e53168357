//! linputd library
//!
//! Captures key and button events from physically connected input devices and
//! publishes them into a shared-memory slot channel owned by a consumer process:
//! - Device discovery, bus filtering and hotplug rescans
//! - The epoll-driven event loop
//! - Time and scan-code normalization (see `linput_common::normalize`)
//! - The lock-guarded channel publisher
//! - Shutdown on signals or loss of the consumer

pub mod channel;
pub mod config;
pub mod device;
pub mod event_loop;
pub mod hotplug;
pub mod lifecycle;
pub mod mux;

// Re-export common types
pub use linput_common::{RawEvent, WireEvent, SLOT_COUNT};

/// Install the console logger used by both binaries
pub fn init_logging(level: linput_common::tracing::Level) {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
