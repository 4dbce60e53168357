//! Fake input devices for integration tests.
//!
//! Nodes are plain files in a temporary directory so enumeration and inotify
//! behave as usual; opening one yields a socket pair whose read end is what the
//! event loop polls.

#![allow(dead_code)]

use linput_common::{DeviceTime, RawEvent, EV_KEY};
use linputd::channel::{ChannelLock, LockError};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub use linputd::device::{BUS_BLUETOOTH, BUS_I8042, BUS_USB, BUS_VIRTUAL};

const RECORD_LEN: usize = 24;

#[derive(Debug, Clone, Copy)]
pub struct FakeKind {
    pub bus: u16,
    pub pointer: bool,
    pub fail_open: bool,
}

impl FakeKind {
    pub fn keyboard(bus: u16) -> Self {
        Self { bus, pointer: false, fail_open: false }
    }

    pub fn mouse(bus: u16) -> Self {
        Self { bus, pointer: true, fail_open: false }
    }

    pub fn broken() -> Self {
        Self { bus: BUS_USB, pointer: false, fail_open: true }
    }
}

#[derive(Default)]
struct FakeState {
    kinds: HashMap<String, FakeKind>,
    writers: HashMap<String, UnixStream>,
    unplugged: HashSet<String>,
    opened: usize,
    live: usize,
}

/// A temporary device directory plus the backend that opens its nodes
pub struct FakeInput {
    dir: TempDir,
    state: Arc<Mutex<FakeState>>,
}

impl FakeInput {
    pub fn new() -> Self {
        Self { dir: TempDir::new().unwrap(), state: Arc::default() }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn backend(&self) -> FakeBackend {
        FakeBackend { state: Arc::clone(&self.state) }
    }

    /// Create a node in the directory
    pub fn add(&self, name: &str, kind: FakeKind) {
        {
            let mut state = self.state.lock().unwrap();
            state.kinds.insert(name.to_string(), kind);
            state.unplugged.remove(name);
        }
        fs::write(self.dir.path().join(name), b"").unwrap();
    }

    /// Remove the node; an already open handle reports ENODEV from now on
    pub fn unplug(&self, name: &str) {
        {
            let mut state = self.state.lock().unwrap();
            state.unplugged.insert(name.to_string());
            state.kinds.remove(name);
        }
        fs::remove_file(self.dir.path().join(name)).unwrap();
    }

    /// Mark an open handle as gone without touching the directory
    pub fn fail_reads(&self, name: &str) {
        self.state.lock().unwrap().unplugged.insert(name.to_string());
    }

    /// Queue an event on the currently open handle for `name`
    pub fn emit(&self, name: &str, kind: u16, code: u16, value: i32) {
        let event = RawEvent { time: DeviceTime::new(1_700_000_000, 500_000), kind, code, value };
        let mut state = self.state.lock().unwrap();
        let writer = state.writers.get_mut(name).expect("device not open");
        writer.write_all(&encode(&event)).unwrap();
    }

    pub fn key(&self, name: &str, code: u16, value: i32) {
        self.emit(name, EV_KEY, code, value);
    }

    /// Number of handles opened so far
    pub fn opened(&self) -> usize {
        self.state.lock().unwrap().opened
    }

    /// Number of handles currently open
    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live
    }
}

#[derive(Clone)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

pub struct FakeDevice {
    name: String,
    kind: FakeKind,
    reader: UnixStream,
    buffer: Vec<u8>,
    state: Arc<Mutex<FakeState>>,
}

impl linputd::device::DeviceBackend for FakeBackend {
    type Device = FakeDevice;

    fn open(&self, path: &Path) -> io::Result<FakeDevice> {
        let name = path.file_name().and_then(|s| s.to_str()).unwrap_or_default().to_string();
        let mut state = self.state.lock().unwrap();

        let kind = *state
            .kinds
            .get(&name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such fake device"))?;
        if kind.fail_open {
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }

        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        state.writers.insert(name.clone(), writer);
        state.opened += 1;
        state.live += 1;

        Ok(FakeDevice { name, kind, reader, buffer: Vec::new(), state: Arc::clone(&self.state) })
    }
}

impl linputd::device::InputDevice for FakeDevice {
    fn fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }

    fn bus_type(&self) -> u16 {
        self.kind.bus
    }

    fn reports_relative_motion(&self) -> bool {
        self.kind.pointer
    }

    fn read_events(&mut self, out: &mut Vec<RawEvent>) -> io::Result<()> {
        if self.state.lock().unwrap().unplugged.contains(&self.name) {
            return Err(io::Error::from_raw_os_error(libc::ENODEV));
        }

        let mut chunk = [0u8; RECORD_LEN * 16];
        let n = self.reader.read(&mut chunk)?;
        self.buffer.extend_from_slice(&chunk[..n]);

        let whole = self.buffer.len() / RECORD_LEN * RECORD_LEN;
        for record in self.buffer[..whole].chunks_exact(RECORD_LEN) {
            out.push(decode(record));
        }
        self.buffer.drain(..whole);
        Ok(())
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.live -= 1;
        }
    }
}

fn encode(event: &RawEvent) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(RECORD_LEN);
    bytes.extend_from_slice(&event.time.secs.to_le_bytes());
    bytes.extend_from_slice(&event.time.micros.to_le_bytes());
    bytes.extend_from_slice(&event.kind.to_le_bytes());
    bytes.extend_from_slice(&event.code.to_le_bytes());
    bytes.extend_from_slice(&event.value.to_le_bytes());
    bytes
}

fn decode(bytes: &[u8]) -> RawEvent {
    let i64_at = |at: usize| i64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
    let u16_at = |at: usize| u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap());
    RawEvent {
        time: DeviceTime::new(i64_at(0), i64_at(8)),
        kind: u16_at(16),
        code: u16_at(18),
        value: i32::from_le_bytes(bytes[20..24].try_into().unwrap()),
    }
}

/// Lock that is always free, for single-process tests
pub struct FreeLock;

impl ChannelLock for FreeLock {
    fn acquire(&self, _timeout: Duration) -> Result<(), LockError> {
        Ok(())
    }

    fn release(&self) -> Result<(), LockError> {
        Ok(())
    }
}

pub fn path_of(input: &FakeInput, name: &str) -> PathBuf {
    input.dir().join(name)
}
