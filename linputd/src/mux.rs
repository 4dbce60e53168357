//! Thin wrapper over epoll that tags every registration with its [`Source`].

use linput_common::tracing;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use std::os::fd::BorrowedFd;
use std::time::Duration;
use tracing::debug;

/// Identifies a tracked device within one registry generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceToken {
    pub generation: u32,
    pub index: u32,
}

/// What a registered descriptor belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Hotplug,
    Device(DeviceToken),
}

const HOTPLUG_DATA: u64 = u64::MAX;

impl Source {
    pub fn to_data(self) -> u64 {
        match self {
            Source::Hotplug => HOTPLUG_DATA,
            Source::Device(token) => ((token.generation as u64) << 32) | token.index as u64,
        }
    }

    pub fn from_data(data: u64) -> Self {
        if data == HOTPLUG_DATA {
            return Source::Hotplug;
        }
        Source::Device(DeviceToken {
            generation: (data >> 32) as u32,
            index: data as u32,
        })
    }
}

/// Readiness multiplexer over every descriptor the loop watches
pub struct Multiplexer {
    epoll: Epoll,
    registered: usize,
}

impl Multiplexer {
    pub fn new() -> Result<Self, Errno> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self { epoll, registered: 0 })
    }

    /// Watch `fd` for readability
    pub fn register(&mut self, fd: BorrowedFd<'_>, source: Source) -> Result<(), Errno> {
        self.epoll.add(fd, EpollEvent::new(EpollFlags::EPOLLIN, source.to_data()))?;
        self.registered += 1;
        debug!("Registered {:?} with the multiplexer", source);
        Ok(())
    }

    pub fn deregister(&mut self, fd: BorrowedFd<'_>) -> Result<(), Errno> {
        self.epoll.delete(fd)?;
        self.registered = self.registered.saturating_sub(1);
        Ok(())
    }

    /// Wait up to `timeout` for readiness; returns how many entries of `events` were filled
    pub fn wait(&self, events: &mut [EpollEvent], timeout: Duration) -> Result<usize, Errno> {
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        self.epoll.wait(events, EpollTimeout::from(millis))
    }

    /// Number of live registrations
    pub fn registered(&self) -> usize {
        self.registered
    }
}
