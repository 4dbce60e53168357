use crate::mux::{DeviceToken, Multiplexer, Source};
use evdev::{Device as EvdevDevice, EventType};
use linput_common::{tracing, DeviceTime, RawEvent};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;
use tracing::{debug, error, info, warn};

// Connection bus classifications from linux/input.h
pub const BUS_USB: u16 = 0x03;
pub const BUS_BLUETOOTH: u16 = 0x05;
pub const BUS_VIRTUAL: u16 = 0x06;
pub const BUS_I8042: u16 = 0x11;

/// Whether a device on `bus` is a physically connected HID we forward
pub fn is_eligible_bus(bus: u16) -> bool {
    matches!(bus, BUS_USB | BUS_BLUETOOTH | BUS_I8042)
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to open device directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: io::Error,
    },
}

/// An open input source the registry can track
pub trait InputDevice {
    fn fd(&self) -> BorrowedFd<'_>;

    fn bus_type(&self) -> u16;

    /// True for mice and other devices that report relative motion
    fn reports_relative_motion(&self) -> bool;

    /// Append every event currently pending on the device to `out`.
    ///
    /// Returns `WouldBlock` once nothing is pending and `ENODEV` when the device is gone.
    fn read_events(&mut self, out: &mut Vec<RawEvent>) -> io::Result<()>;
}

/// Opens device nodes into [`InputDevice`]s
pub trait DeviceBackend {
    type Device: InputDevice;

    fn open(&self, path: &Path) -> io::Result<Self::Device>;
}

/// Production backend reading through evdev
#[derive(Debug, Clone, Copy, Default)]
pub struct EvdevBackend;

pub struct EvdevInput {
    device: EvdevDevice,
}

/// Open a device node read-only and non-blocking, so draining stops at WouldBlock
pub fn open_node(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(path)
}

impl DeviceBackend for EvdevBackend {
    type Device = EvdevInput;

    fn open(&self, path: &Path) -> io::Result<EvdevInput> {
        let file = open_node(path)?;
        let device = EvdevDevice::from_fd(OwnedFd::from(file))?;

        debug!("Opened {} ({})", path.display(), device.name().unwrap_or("unnamed"));
        Ok(EvdevInput { device })
    }
}

impl InputDevice for EvdevInput {
    fn fd(&self) -> BorrowedFd<'_> {
        self.device.as_fd()
    }

    fn bus_type(&self) -> u16 {
        self.device.input_id().bus_type().0
    }

    fn reports_relative_motion(&self) -> bool {
        self.device.supported_events().contains(EventType::RELATIVE)
    }

    fn read_events(&mut self, out: &mut Vec<RawEvent>) -> io::Result<()> {
        for event in self.device.fetch_events()? {
            let since_epoch = event.timestamp().duration_since(UNIX_EPOCH).unwrap_or_default();
            out.push(RawEvent {
                time: DeviceTime::new(since_epoch.as_secs() as i64, since_epoch.subsec_micros() as i64),
                kind: event.event_type().0,
                code: event.code(),
                value: event.value(),
            });
        }
        Ok(())
    }
}

/// A device the registry owns, registered with the multiplexer
pub struct TrackedDevice<D> {
    pub path: PathBuf,
    pub bus: u16,
    pub pointer: bool,
    pub device: D,
}

/// Owns every open eligible device and its multiplexer registration
pub struct DeviceRegistry<B: DeviceBackend> {
    backend: B,
    dir: PathBuf,
    prefix: String,
    devices: Vec<TrackedDevice<B::Device>>,
    generation: u32,
}

impl<B: DeviceBackend> DeviceRegistry<B> {
    pub fn new<P: Into<PathBuf>>(backend: B, dir: P, prefix: &str) -> Self {
        Self {
            backend,
            dir: dir.into(),
            prefix: prefix.to_string(),
            devices: Vec::new(),
            generation: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn devices(&self) -> impl Iterator<Item = &TrackedDevice<B::Device>> {
        self.devices.iter()
    }

    /// Resolve a multiplexer token; tokens from an earlier generation never resolve
    pub fn get_mut(&mut self, token: DeviceToken) -> Option<&mut TrackedDevice<B::Device>> {
        if token.generation != self.generation {
            return None;
        }
        self.devices.get_mut(token.index as usize)
    }

    /// Release every tracked device, then enumerate the directory again.
    ///
    /// Per-device failures only skip that device. Returns the number of tracked devices.
    pub fn rescan(&mut self, mux: &mut Multiplexer) -> Result<usize, RegistryError> {
        self.release_all(mux);
        self.generation = self.generation.wrapping_add(1);

        let entries = fs::read_dir(&self.dir).map_err(|source| {
            error!("Failed to open directory {}: {}", self.dir.display(), source);
            RegistryError::Directory { path: self.dir.clone(), source }
        })?;

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|s| s.to_str())
                    .is_some_and(|name| name.starts_with(&self.prefix))
            })
            .collect();
        paths.sort();

        for path in paths {
            self.try_track(path, mux);
        }

        info!("Tracking {} input devices", self.devices.len());
        Ok(self.devices.len())
    }

    fn try_track(&mut self, path: PathBuf, mux: &mut Multiplexer) {
        let device = match self.backend.open(&path) {
            Ok(device) => device,
            Err(e) => {
                warn!("Failed to open {}: {}", path.display(), e);
                return;
            }
        };

        let bus = device.bus_type();
        if !is_eligible_bus(bus) {
            debug!("Skipping {} on bus {:#06x}", path.display(), bus);
            return;
        }

        let token = DeviceToken {
            generation: self.generation,
            index: self.devices.len() as u32,
        };
        if let Err(e) = mux.register(device.fd(), Source::Device(token)) {
            warn!("Failed to add {} to the multiplexer: {}", path.display(), e);
            return;
        }

        let pointer = device.reports_relative_motion();
        info!("Tracking {} (bus {:#06x}, {})", path.display(), bus,
              if pointer { "pointer" } else { "keyboard" });
        self.devices.push(TrackedDevice { path, bus, pointer, device });
    }

    /// Deregister and close every tracked device
    pub fn release_all(&mut self, mux: &mut Multiplexer) {
        for tracked in self.devices.drain(..) {
            if let Err(e) = mux.deregister(tracked.device.fd()) {
                debug!("Failed to deregister {}: {}", tracked.path.display(), e);
            }
        }
    }
}
