//! Producer side of the shared slot channel.
//!
//! The consumer creates a POSIX shared memory object holding [`SLOT_COUNT`]
//! records and a named semaphore (initial value 1) used as the lock around it.
//! We only ever open both by name.

use crate::config::ChannelSettings;
use linput_common::{tracing, SlotStore, WireEvent, EVENT_NO_DEVICES, SLOT_COUNT};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::shm_open;
use nix::sys::stat::Mode;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::ptr::{self, NonNull};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum LockError {
    #[error("timed out waiting for lock")]
    Timeout,

    #[error("invalid semaphore name {0:?}")]
    InvalidName(String),

    #[error("failed to open semaphore {name}: {source}")]
    Open { name: String, source: Errno },

    #[error("semaphore operation failed: {0}")]
    Os(#[from] Errno),
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("failed to open shared memory {name}: {source}")]
    Open { name: String, source: Errno },

    #[error("failed to inspect shared memory: {0}")]
    Stat(io::Error),

    #[error("shared memory {name} holds {size} bytes, {required} required")]
    TooSmall { name: String, size: u64, required: usize },

    #[error("failed to map shared memory: {0}")]
    Map(io::Error),

    #[error("failed to open channel lock: {0}")]
    Lock(#[from] LockError),
}

/// Cross-process lock guarding the slot array
pub trait ChannelLock {
    fn acquire(&self, timeout: Duration) -> Result<(), LockError>;

    fn release(&self) -> Result<(), LockError>;
}

/// Releases the lock when dropped
struct LockGuard<'a, L: ChannelLock> {
    lock: &'a L,
}

impl<'a, L: ChannelLock> LockGuard<'a, L> {
    fn acquire(lock: &'a L, timeout: Duration) -> Result<Self, LockError> {
        lock.acquire(timeout)?;
        Ok(Self { lock })
    }
}

impl<L: ChannelLock> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            error!("Failed to release channel lock: {}", e);
        }
    }
}

/// A named POSIX semaphore opened (never created) by name
pub struct NamedSemaphore {
    sem: NonNull<libc::sem_t>,
    name: String,
}

// POSIX semaphores may be used from any thread
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    pub fn open(name: &str) -> Result<Self, LockError> {
        let c_name = CString::new(name).map_err(|_| LockError::InvalidName(name.to_string()))?;

        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(LockError::Open { name: name.to_string(), source: Errno::last() });
        }
        let sem = NonNull::new(sem)
            .ok_or_else(|| LockError::Open { name: name.to_string(), source: Errno::EINVAL })?;

        debug!("Opened semaphore {}", name);
        Ok(Self { sem, name: name.to_string() })
    }

    /// Whether a semaphore with this name currently exists
    pub fn exists(name: &str) -> bool {
        Self::open(name).is_ok()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait at most `timeout` to decrement the semaphore
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), LockError> {
        let deadline = (SystemTime::now() + timeout)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let deadline = libc::timespec {
            tv_sec: deadline.as_secs() as _,
            tv_nsec: deadline.subsec_nanos() as _,
        };

        loop {
            if unsafe { libc::sem_timedwait(self.sem.as_ptr(), &deadline) } == 0 {
                return Ok(());
            }
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::ETIMEDOUT => return Err(LockError::Timeout),
                e => return Err(LockError::Os(e)),
            }
        }
    }

    pub fn post(&self) -> Result<(), LockError> {
        if unsafe { libc::sem_post(self.sem.as_ptr()) } != 0 {
            return Err(LockError::Os(Errno::last()));
        }
        Ok(())
    }
}

impl ChannelLock for NamedSemaphore {
    fn acquire(&self, timeout: Duration) -> Result<(), LockError> {
        self.wait_timeout(timeout)
    }

    fn release(&self) -> Result<(), LockError> {
        self.post()
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem.as_ptr());
        }
    }
}

/// Our mapping of the consumer's slot array
pub struct SharedMemory {
    base: NonNull<WireEvent>,
    slots: usize,
    _file: File,
}

impl SharedMemory {
    /// Map the first `slots` records of the shared memory object `name`
    pub fn open(name: &str, slots: usize) -> Result<Self, ChannelError> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())
            .map_err(|source| ChannelError::Open { name: name.to_string(), source })?;
        let file = File::from(fd);

        let required = slots * mem::size_of::<WireEvent>();
        let size = file.metadata().map_err(ChannelError::Stat)?.len();
        if size < required as u64 {
            return Err(ChannelError::TooSmall { name: name.to_string(), size, required });
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                required,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(ChannelError::Map(io::Error::last_os_error()));
        }
        let base = NonNull::new(addr.cast::<WireEvent>())
            .ok_or_else(|| ChannelError::Map(io::Error::from(io::ErrorKind::InvalidData)))?;

        info!("Mapped {} slots of shared memory {}", slots, name);
        Ok(Self { base, slots, _file: file })
    }

    fn slot(&self, index: usize) -> *mut WireEvent {
        assert!(index < self.slots, "slot {} out of range ({} slots)", index, self.slots);
        unsafe { self.base.as_ptr().add(index) }
    }
}

impl SlotStore for SharedMemory {
    fn capacity(&self) -> usize {
        self.slots
    }

    fn read(&self, index: usize) -> WireEvent {
        unsafe { ptr::read_volatile(self.slot(index)) }
    }

    fn write(&mut self, index: usize, record: WireEvent) {
        unsafe { ptr::write_volatile(self.slot(index), record) }
    }

    fn write_kind(&mut self, index: usize, kind: u16) {
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.slot(index)).kind), kind) }
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        let len = self.slots * mem::size_of::<WireEvent>();
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), len);
        }
        debug!("Unmapped shared memory");
    }
}

/// Result of one publish attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Written(usize),
    ChannelFull,
    TimedOut,
    LockFailed,
    Rejected,
}

/// Receives every record the event loop produces
pub trait EventSink {
    fn publish(&mut self, record: WireEvent);

    /// Tell the consumer that no input device could be opened
    fn announce_no_devices(&mut self);
}

/// Writes records into the first empty slot under the channel lock
pub struct Publisher<S: SlotStore, L: ChannelLock> {
    slots: S,
    lock: L,
    timeout: Duration,
}

pub type ChannelPublisher = Publisher<SharedMemory, NamedSemaphore>;

/// Open the consumer's shared memory and lock
pub fn open_channel(settings: &ChannelSettings) -> Result<ChannelPublisher, ChannelError> {
    let slots = SharedMemory::open(&settings.shm_name, SLOT_COUNT)?;
    let lock = NamedSemaphore::open(&settings.mutex_name)?;
    Ok(Publisher::new(slots, lock, settings.lock_timeout()))
}

impl<S: SlotStore, L: ChannelLock> Publisher<S, L> {
    pub fn new(slots: S, lock: L, timeout: Duration) -> Self {
        Self { slots, lock, timeout }
    }

    pub fn slots(&self) -> &S {
        &self.slots
    }

    pub fn lock(&self) -> &L {
        &self.lock
    }

    /// Write `record` into the lowest-index empty slot; dropped if none is free
    pub fn publish_record(&mut self, record: WireEvent) -> PublishOutcome {
        if record.is_empty() {
            warn!("Refusing to publish a record with the empty type");
            return PublishOutcome::Rejected;
        }

        let _guard = match lock_channel(&self.lock, self.timeout) {
            Ok(guard) => guard,
            Err(outcome) => return outcome,
        };

        match self.slots.first_empty() {
            Some(index) => {
                self.slots.write(index, record);
                PublishOutcome::Written(index)
            }
            None => PublishOutcome::ChannelFull,
        }
    }

    /// Mark slot 0 with the "no input devices" type
    pub fn publish_no_devices(&mut self) -> PublishOutcome {
        let _guard = match lock_channel(&self.lock, self.timeout) {
            Ok(guard) => guard,
            Err(outcome) => return outcome,
        };

        self.slots.write_kind(0, EVENT_NO_DEVICES);
        PublishOutcome::Written(0)
    }
}

fn lock_channel<L: ChannelLock>(lock: &L, timeout: Duration) -> Result<LockGuard<'_, L>, PublishOutcome> {
    LockGuard::acquire(lock, timeout).map_err(|e| match e {
        LockError::Timeout => {
            warn!("Channel lock not acquired within {:?}, dropping event", timeout);
            PublishOutcome::TimedOut
        }
        e => {
            error!("Failed to acquire channel lock: {}", e);
            PublishOutcome::LockFailed
        }
    })
}

impl<S: SlotStore, L: ChannelLock> EventSink for Publisher<S, L> {
    fn publish(&mut self, record: WireEvent) {
        let outcome = self.publish_record(record);
        debug!("Publish {}: {:?}", record, outcome);
    }

    fn announce_no_devices(&mut self) {
        match self.publish_no_devices() {
            PublishOutcome::Written(_) => info!("Reported missing input devices to the consumer"),
            outcome => warn!("Could not report missing input devices: {:?}", outcome),
        }
    }
}
