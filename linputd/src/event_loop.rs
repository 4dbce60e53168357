use crate::channel::EventSink;
use crate::device::{DeviceBackend, DeviceRegistry, InputDevice, RegistryError};
use crate::hotplug::HotplugWatch;
use crate::lifecycle::ShutdownFlag;
use crate::mux::{DeviceToken, Multiplexer, Source};
use linput_common::{keys, normalize, tracing, RawEvent};
use nix::errno::Errno;
use nix::sys::epoll::EpollEvent;
use std::io;
use std::os::fd::AsFd;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Readiness reports handled per wait
pub const MAX_EVENTS: usize = 10;

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("failed to create multiplexer: {0}")]
    Multiplexer(Errno),

    #[error("failed to watch device directory: {0}")]
    Hotplug(Errno),

    #[error("device rescan failed: {0}")]
    Rescan(#[from] RegistryError),

    #[error("waiting for input failed: {0}")]
    Wait(Errno),

    #[error("no eligible input devices")]
    NoDevices,
}

/// How draining one device ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drain {
    Idle,
    Failed,
    Rescanned,
}

/// Reads every tracked device and forwards key events to the sink until shutdown
pub struct EventLoop<B: DeviceBackend, S: EventSink> {
    registry: DeviceRegistry<B>,
    mux: Multiplexer,
    hotplug: Option<HotplugWatch>,
    sink: S,
    shutdown: ShutdownFlag,
    poll_timeout: Duration,
    ready: Vec<EpollEvent>,
    pending: Vec<RawEvent>,
}

impl<B: DeviceBackend, S: EventSink> EventLoop<B, S> {
    /// Set up the multiplexer and, if `watch_hotplug`, the directory watch
    pub fn new(
        registry: DeviceRegistry<B>,
        sink: S,
        shutdown: ShutdownFlag,
        poll_timeout: Duration,
        watch_hotplug: bool,
    ) -> Result<Self, LoopError> {
        let mut mux = Multiplexer::new().map_err(LoopError::Multiplexer)?;

        let hotplug = if watch_hotplug {
            let watch = HotplugWatch::new(registry.dir()).map_err(|e| {
                error!("Failed to watch {}: {}", registry.dir().display(), e);
                LoopError::Hotplug(e)
            })?;
            mux.register(watch.as_fd(), Source::Hotplug).map_err(LoopError::Multiplexer)?;
            Some(watch)
        } else {
            None
        };

        Ok(Self {
            registry,
            mux,
            hotplug,
            sink,
            shutdown,
            poll_timeout,
            ready: vec![EpollEvent::empty(); MAX_EVENTS],
            pending: Vec::new(),
        })
    }

    pub fn registry(&self) -> &DeviceRegistry<B> {
        &self.registry
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    /// Initial enumeration. With no eligible device the consumer is told so
    /// and the loop must not be run.
    pub fn start(&mut self) -> Result<usize, LoopError> {
        let count = self.registry.rescan(&mut self.mux)?;
        if count == 0 {
            error!("No input devices");
            self.sink.announce_no_devices();
            return Err(LoopError::NoDevices);
        }
        Ok(count)
    }

    /// Run until shutdown is requested or a fatal error occurs
    pub fn run(&mut self) -> Result<(), LoopError> {
        info!("Waiting for input events");
        while !self.shutdown.is_requested() {
            self.turn()?;
        }
        info!("Shutdown requested, leaving event loop");
        Ok(())
    }

    /// One iteration: hotplug check, one bounded wait, then drain ready devices
    pub fn turn(&mut self) -> Result<(), LoopError> {
        self.check_hotplug()?;

        let count = match self.mux.wait(&mut self.ready, self.poll_timeout) {
            Ok(count) => count,
            Err(Errno::EINTR) => return Ok(()),
            Err(e) => {
                error!("Failed to wait for input: {}", e);
                return Err(LoopError::Wait(e));
            }
        };

        for i in 0..count {
            let token = match Source::from_data(self.ready[i].data()) {
                Source::Hotplug => {
                    if self.check_hotplug()? {
                        break;
                    }
                    continue;
                }
                Source::Device(token) => token,
            };

            if self.drain(token)? == Drain::Rescanned {
                // Remaining reports refer to the previous generation
                break;
            }
        }
        Ok(())
    }

    /// Rescan if the device directory changed; true if a rescan happened
    fn check_hotplug(&mut self) -> Result<bool, LoopError> {
        let changed = self.hotplug.as_ref().is_some_and(HotplugWatch::take_pending);
        if !changed {
            return Ok(false);
        }

        info!("Updating input devices...");
        self.registry.rescan(&mut self.mux)?;
        Ok(true)
    }

    fn drain(&mut self, token: DeviceToken) -> Result<Drain, LoopError> {
        loop {
            self.pending.clear();

            let Some(tracked) = self.registry.get_mut(token) else {
                debug!("Ignoring stale readiness report {:?}", token);
                return Ok(Drain::Idle);
            };
            let pointer = tracked.pointer;

            match tracked.device.read_events(&mut self.pending) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Drain::Idle),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::ENODEV) => {
                    info!("{} disconnected, rescanning", tracked.path.display());
                    self.registry.rescan(&mut self.mux)?;
                    return Ok(Drain::Rescanned);
                }
                Err(e) => {
                    warn!("Error reading event from {}: {}", tracked.path.display(), e);
                    return Ok(Drain::Failed);
                }
            }

            if self.pending.is_empty() {
                return Ok(Drain::Idle);
            }

            for event in &self.pending {
                if let Some(record) = normalize::to_wire(event, pointer) {
                    debug!("{} {} -> {}", keys::key_name(event.code), event.value, record);
                    self.sink.publish(record);
                }
            }
        }
    }
}

impl<B: DeviceBackend, S: EventSink> Drop for EventLoop<B, S> {
    fn drop(&mut self) {
        self.registry.release_all(&mut self.mux);
        if let Some(watch) = self.hotplug.take() {
            if let Err(e) = self.mux.deregister(watch.as_fd()) {
                debug!("Failed to deregister hotplug watch: {}", e);
            }
        }
        debug!("Released input devices and hotplug watch");
    }
}
