//! Shutdown signalling.
//!
//! The only state shared between the event loop thread and the liveness
//! watcher thread is a [`ShutdownFlag`]. Signal handlers set the same flag.

use crate::channel::{LockError, NamedSemaphore};
use linput_common::tracing;
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// How long one liveness wait lasts before re-checking the handle still exists
pub const LIVENESS_SLICE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("failed to install handler for {signal:?}: {source}")]
    Signal { signal: Signal, source: Errno },

    #[error("failed to spawn liveness watcher: {0}")]
    Spawn(io::Error),
}

/// Cooperative stop request, set once and never cleared
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

static SIGNAL_FLAG: OnceLock<ShutdownFlag> = OnceLock::new();

extern "C" fn on_terminate(_: libc::c_int) {
    // Only an atomic store happens here
    if let Some(flag) = SIGNAL_FLAG.get() {
        flag.request();
    }
}

/// Make SIGINT and SIGTERM request shutdown through `flag`.
///
/// Only the first flag passed in is ever signalled. SA_RESTART is left off so a
/// blocked wait returns EINTR and the loop sees the flag right away.
pub fn install_signal_handlers(flag: &ShutdownFlag) -> Result<(), LifecycleError> {
    if SIGNAL_FLAG.set(flag.clone()).is_err() {
        warn!("Signal handlers already installed");
    }

    let action = SigAction::new(SigHandler::Handler(on_terminate), SaFlags::empty(), SigSet::empty());
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        unsafe { signal::sigaction(sig, &action) }
            .map_err(|source| LifecycleError::Signal { signal: sig, source })?;
    }

    debug!("Installed SIGINT/SIGTERM handlers");
    Ok(())
}

/// Why the liveness watcher requested shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEnd {
    /// The consumer signalled the handle
    Signaled,
    /// The handle could not be opened or was removed
    Lost,
    /// Shutdown was already requested elsewhere
    Stopped,
}

/// Block until the liveness handle `name` is signaled or disappears, then set `flag`
pub fn watch_liveness(name: &str, flag: &ShutdownFlag, slice: Duration) -> LivenessEnd {
    let handle = match NamedSemaphore::open(name) {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to open liveness handle: {}", e);
            flag.request();
            return LivenessEnd::Lost;
        }
    };

    debug!("Watching liveness handle {}", handle.name());

    let end = loop {
        if flag.is_requested() {
            break LivenessEnd::Stopped;
        }

        match handle.wait_timeout(slice) {
            Ok(()) => {
                // Hand the token back so other waiters observe it too
                if let Err(e) = handle.post() {
                    warn!("Failed to re-signal liveness handle: {}", e);
                }
                info!("Consumer signaled shutdown");
                break LivenessEnd::Signaled;
            }
            Err(LockError::Timeout) => {
                if !NamedSemaphore::exists(handle.name()) {
                    info!("Liveness handle {} disappeared", handle.name());
                    break LivenessEnd::Lost;
                }
            }
            Err(e) => {
                error!("Waiting on liveness handle failed: {}", e);
                break LivenessEnd::Lost;
            }
        }
    };

    flag.request();
    end
}

/// Run [`watch_liveness`] on a background thread
pub fn spawn_liveness_watcher(name: &str, flag: ShutdownFlag) -> Result<JoinHandle<LivenessEnd>, LifecycleError> {
    let name = name.to_string();
    thread::Builder::new()
        .name("liveness-watcher".to_string())
        .spawn(move || watch_liveness(&name, &flag, LIVENESS_SLICE))
        .map_err(LifecycleError::Spawn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::time::Instant;

    struct TestSemaphore {
        name: String,
        sem: *mut libc::sem_t,
    }

    impl TestSemaphore {
        fn create(tag: &str) -> Self {
            let name = format!("/linput-live-{}-{}", tag, std::process::id());
            let c_name = CString::new(name.clone()).unwrap();
            unsafe { libc::sem_unlink(c_name.as_ptr()) };
            let sem = unsafe {
                libc::sem_open(c_name.as_ptr(), libc::O_CREAT | libc::O_EXCL, 0o600 as libc::c_uint, 0 as libc::c_uint)
            };
            assert_ne!(sem, libc::SEM_FAILED);
            Self { name, sem }
        }

        fn post(&self) {
            assert_eq!(unsafe { libc::sem_post(self.sem) }, 0);
        }

        fn unlink(&self) {
            let c_name = CString::new(self.name.clone()).unwrap();
            unsafe { libc::sem_unlink(c_name.as_ptr()) };
        }
    }

    impl Drop for TestSemaphore {
        fn drop(&mut self) {
            self.unlink();
            unsafe { libc::sem_close(self.sem) };
        }
    }

    #[test]
    fn test_flag_is_shared_between_clones() {
        let flag = ShutdownFlag::new();
        let other = flag.clone();
        assert!(!other.is_requested());
        flag.request();
        assert!(other.is_requested());
    }

    #[test]
    fn test_missing_handle_requests_shutdown() {
        let flag = ShutdownFlag::new();
        let end = watch_liveness("/linput-live-never-created", &flag, Duration::from_millis(10));
        assert_eq!(end, LivenessEnd::Lost);
        assert!(flag.is_requested());
    }

    #[test]
    fn test_signaled_handle_requests_shutdown() {
        let sem = TestSemaphore::create("signal");
        let flag = ShutdownFlag::new();
        let watcher = {
            let name = sem.name.clone();
            let flag = flag.clone();
            thread::spawn(move || watch_liveness(&name, &flag, Duration::from_millis(20)))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!flag.is_requested());

        sem.post();
        assert_eq!(watcher.join().unwrap(), LivenessEnd::Signaled);
        assert!(flag.is_requested());
    }

    #[test]
    fn test_removed_handle_requests_shutdown() {
        let sem = TestSemaphore::create("removed");
        let flag = ShutdownFlag::new();
        let watcher = {
            let name = sem.name.clone();
            let flag = flag.clone();
            thread::spawn(move || watch_liveness(&name, &flag, Duration::from_millis(20)))
        };

        thread::sleep(Duration::from_millis(50));
        sem.unlink();
        assert_eq!(watcher.join().unwrap(), LivenessEnd::Lost);
        assert!(flag.is_requested());
    }

    #[test]
    fn test_watcher_exits_once_stopped() {
        let sem = TestSemaphore::create("stopped");
        let flag = ShutdownFlag::new();
        let watcher = {
            let name = sem.name.clone();
            let flag = flag.clone();
            thread::spawn(move || watch_liveness(&name, &flag, Duration::from_millis(20)))
        };

        let started = Instant::now();
        flag.request();
        assert_eq!(watcher.join().unwrap(), LivenessEnd::Stopped);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_sigterm_sets_flag() {
        let flag = ShutdownFlag::new();
        install_signal_handlers(&flag).unwrap();
        signal::raise(Signal::SIGTERM).unwrap();
        assert!(flag.is_requested());
    }
}
