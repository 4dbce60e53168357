use linput_common::tracing;
use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;
use tracing::{debug, warn};

/// Non-blocking inotify watch on the device directory
pub struct HotplugWatch {
    inotify: Inotify,
    watch: WatchDescriptor,
}

impl HotplugWatch {
    /// Watch `dir` for nodes being created, deleted or changing attributes
    pub fn new(dir: &Path) -> Result<Self, Errno> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
        let watch = inotify.add_watch(
            dir,
            AddWatchFlags::IN_CREATE | AddWatchFlags::IN_DELETE | AddWatchFlags::IN_ATTRIB,
        )?;
        debug!("Watching {} for hotplug events", dir.display());
        Ok(Self { inotify, watch })
    }

    /// Drain pending notifications; true if there were any.
    ///
    /// The notifications themselves are discarded, any change means a full rescan.
    pub fn take_pending(&self) -> bool {
        let mut changed = false;
        loop {
            match self.inotify.read_events() {
                Ok(events) if events.is_empty() => break,
                Ok(events) => {
                    debug!("Received {} hotplug notifications", events.len());
                    changed = true;
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("Failed to read hotplug notifications: {}", e);
                    break;
                }
            }
        }
        changed
    }
}

impl AsFd for HotplugWatch {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inotify.as_fd()
    }
}

impl Drop for HotplugWatch {
    fn drop(&mut self) {
        if let Err(e) = self.inotify.rm_watch(self.watch) {
            debug!("Failed to remove hotplug watch: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_reports_create_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let watch = HotplugWatch::new(temp_dir.path()).unwrap();
        assert!(!watch.take_pending());

        let node = temp_dir.path().join("event7");
        fs::write(&node, b"").unwrap();
        assert!(watch.take_pending());
        assert!(!watch.take_pending());

        fs::remove_file(&node).unwrap();
        assert!(watch.take_pending());
    }

    #[test]
    fn test_missing_directory_fails() {
        let temp_dir = TempDir::new().unwrap();
        assert!(HotplugWatch::new(&temp_dir.path().join("gone")).is_err());
    }
}
