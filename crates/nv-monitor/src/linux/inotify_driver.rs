//! Inotify Driver (C3): maintains a `path → wd` bimap and normalizes
//! raw inotify events for the aggregator (§4.3).

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use nix::sys::inotify::{AddWatchFlags, Inotify, InotifyEvent, WatchDescriptor};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::DriverError;
use crate::mask;

/// One normalized inotify delivery handed to the aggregator.
#[derive(Debug, Clone)]
pub struct InotifyDelivery {
    pub path: String,
    pub is_dir: bool,
    pub raw_mask: u32,
    /// `IN_MOVE_SELF`/`IN_MOVED_FROM` seen on an inode that had already
    /// left the filesystem by the time it was processed — classifier
    /// input `inode_moved_mask` (§4.6 "absent path" rule).
    pub inode_moved: bool,
    /// Set when the watch was auto-released (`IN_IGNORED`/`IN_UNMOUNT`)
    /// and the caller should drop any tracked state for `path` (§4.3).
    pub auto_released: bool,
}

/// Mask armed on every watched target (§4.3). `IN_DONT_FOLLOW` is
/// added per-call for directory targets.
fn base_flags() -> AddWatchFlags {
    AddWatchFlags::IN_ATTRIB
        | AddWatchFlags::IN_MODIFY
        | AddWatchFlags::IN_CLOSE_WRITE
        | AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_DELETE_SELF
        | AddWatchFlags::IN_MOVE
        | AddWatchFlags::IN_MOVE_SELF
        | AddWatchFlags::IN_MOVED_TO
}

struct Bimap {
    path_to_wd: HashMap<String, WatchDescriptor>,
    wd_to_path: HashMap<WatchDescriptor, (String, bool)>,
}

impl Bimap {
    fn new() -> Self {
        Self { path_to_wd: HashMap::new(), wd_to_path: HashMap::new() }
    }
}

/// A path ending in `/.*` never gets its own watch: its directory
/// parent already covers it (§4.3).
#[must_use]
pub fn is_wildcard_only(path: &str) -> bool {
    path.ends_with("/.*")
}

pub struct InotifyDriver {
    inotify: Inotify,
    bimap: Mutex<Bimap>,
}

impl InotifyDriver {
    pub fn new() -> Result<Self, DriverError> {
        let inotify = Inotify::init(nix::sys::inotify::InitFlags::IN_NONBLOCK | nix::sys::inotify::InitFlags::IN_CLOEXEC)?;
        Ok(Self { inotify, bimap: Mutex::new(Bimap::new()) })
    }

    /// §4.3 `AddMonitorFile`.
    pub fn add_monitor_file(&self, path: &str) -> Result<(), DriverError> {
        self.arm(path, false)
    }

    /// §4.3 `AddMonitorDirFile`.
    pub fn add_monitor_dir_file(&self, path: &str) -> Result<(), DriverError> {
        self.arm(path, true)
    }

    fn arm(&self, path: &str, is_dir: bool) -> Result<(), DriverError> {
        if is_wildcard_only(path) {
            return Ok(());
        }
        let mut bimap = self.bimap.lock().expect("inotify bimap mutex poisoned");
        if bimap.path_to_wd.contains_key(path) {
            return Err(DriverError::AlreadyArmed(path.to_string()));
        }
        let mut flags = base_flags();
        if is_dir {
            flags |= AddWatchFlags::IN_DONT_FOLLOW;
        }
        let wd = self.inotify.add_watch(path, flags)?;
        bimap.wd_to_path.insert(wd.clone(), (path.to_string(), is_dir));
        bimap.path_to_wd.insert(path.to_string(), wd);
        Ok(())
    }

    /// §4.3 `RemoveMonitorFile`.
    pub fn remove_monitor_file(&self, path: &str) -> Result<(), DriverError> {
        let mut bimap = self.bimap.lock().expect("inotify bimap mutex poisoned");
        let wd = bimap
            .path_to_wd
            .remove(path)
            .ok_or_else(|| DriverError::NotArmed(path.to_string()))?;
        bimap.wd_to_path.remove(&wd);
        // Best-effort: a watch whose backing path is already gone
        // returns ENOENT here, which is not-applicable (§7) and is
        // swallowed rather than propagated.
        let _ = self.inotify.rm_watch(wd);
        Ok(())
    }

    /// §4.3 `ContainerCleanup(rootPid)`: drop every watch whose path
    /// falls under this container's proc root.
    pub fn container_cleanup(&self, proc_root_prefix: &str) {
        let mut bimap = self.bimap.lock().expect("inotify bimap mutex poisoned");
        let doomed: Vec<String> = bimap
            .path_to_wd
            .keys()
            .filter(|p| p.starts_with(proc_root_prefix))
            .cloned()
            .collect();
        for path in doomed {
            if let Some(wd) = bimap.path_to_wd.remove(&path) {
                bimap.wd_to_path.remove(&wd);
                let _ = self.inotify.rm_watch(wd);
            }
        }
    }

    /// §6 `GetProbeData`: `(wds, paths, dirs)`.
    #[must_use]
    pub fn probe_counts(&self) -> (usize, usize, usize) {
        let bimap = self.bimap.lock().expect("inotify bimap mutex poisoned");
        let dirs = bimap.wd_to_path.values().filter(|(_, is_dir)| *is_dir).count();
        (bimap.wd_to_path.len(), bimap.path_to_wd.len(), dirs)
    }

    /// §6 `GetWatchFileList(rootPid)`: every watched path under one
    /// container's proc-root prefix.
    #[must_use]
    pub fn watch_file_list(&self, proc_root_prefix: &str) -> Vec<String> {
        let bimap = self.bimap.lock().expect("inotify bimap mutex poisoned");
        bimap.path_to_wd.keys().filter(|p| p.starts_with(proc_root_prefix)).cloned().collect()
    }

    fn raw_fd(&self) -> RawFd {
        self.inotify.as_raw_fd()
    }

    fn resolve_event(&self, event: &InotifyEvent) -> Option<(String, bool)> {
        let bimap = self.bimap.lock().expect("inotify bimap mutex poisoned");
        bimap.wd_to_path.get(&event.wd).cloned()
    }

    fn release_watch(&self, wd: &WatchDescriptor) {
        let mut bimap = self.bimap.lock().expect("inotify bimap mutex poisoned");
        if let Some((path, _)) = bimap.wd_to_path.remove(wd) {
            bimap.path_to_wd.remove(&path);
        }
    }

    fn to_raw_mask(mask: nix::sys::inotify::AddWatchFlags) -> u32 {
        use nix::sys::inotify::AddWatchFlags as F;
        let mut out = 0;
        if mask.contains(F::IN_ATTRIB) { out |= mask::ATTRIB; }
        if mask.contains(F::IN_MODIFY) { out |= mask::MODIFY; }
        if mask.contains(F::IN_CLOSE_WRITE) { out |= mask::CLOSE_WRITE; }
        if mask.contains(F::IN_CREATE) { out |= mask::CREATE; }
        if mask.contains(F::IN_DELETE) { out |= mask::DELETE; }
        if mask.contains(F::IN_DELETE_SELF) { out |= mask::DELETE_SELF; }
        if mask.contains(F::IN_MOVED_FROM) { out |= mask::MOVED_FROM; }
        if mask.contains(F::IN_MOVED_TO) { out |= mask::MOVED_TO; }
        if mask.contains(F::IN_MOVE_SELF) { out |= mask::MOVE_SELF; }
        if mask.contains(F::IN_ACCESS) { out |= mask::ACCESS; }
        out
    }

    /// Spawns a dedicated blocking reader thread (§5 "fanotify reader,
    /// inotify reader" are separate long-lived workers) and returns a
    /// stream of normalized deliveries.
    pub fn listen(self: Arc<Self>) -> ReceiverStream<InotifyDelivery> {
        let (tx, rx) = mpsc::channel(1024);
        let driver = self;
        std::thread::spawn(move || {
            let mut pfd = [libc::pollfd {
                fd: driver.raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            }];
            loop {
                // SAFETY: `pfd` is a single, correctly-sized buffer
                // owned on this stack frame for the duration of the call.
                let ready = unsafe { libc::poll(pfd.as_mut_ptr(), 1, 1000) };
                if ready <= 0 {
                    continue;
                }
                let events = match driver.inotify.read_events() {
                    Ok(events) => events,
                    Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => continue,
                    Err(_) => break,
                };
                for event in events {
                    use nix::sys::inotify::AddWatchFlags as F;
                    let auto_released = event.mask.contains(F::IN_IGNORED) || event.mask.contains(F::IN_UNMOUNT);
                    let Some((path, is_dir)) = driver.resolve_event(&event) else {
                        continue;
                    };
                    if auto_released {
                        driver.release_watch(&event.wd);
                    }
                    let delivery = InotifyDelivery {
                        path,
                        is_dir,
                        raw_mask: if auto_released { mask::DELETE } else { Self::to_raw_mask(event.mask) },
                        inode_moved: event.mask.contains(F::IN_MOVED_FROM) || event.mask.contains(F::IN_MOVE_SELF),
                        auto_released,
                    };
                    if tx.blocking_send(delivery).is_err() {
                        return;
                    }
                }
            }
        });
        ReceiverStream::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_tail_paths_never_get_own_watch() {
        assert!(is_wildcard_only("/opt/app/.*"));
        assert!(!is_wildcard_only("/opt/app"));
    }

    #[test]
    fn add_then_remove_round_trips_probe_counts() {
        let driver = InotifyDriver::new().expect("inotify available in test sandbox");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched");
        std::fs::write(&path, b"x").unwrap();
        let path_str = path.to_str().unwrap();

        driver.add_monitor_file(path_str).unwrap();
        let (wds, paths, _) = driver.probe_counts();
        assert_eq!(wds, 1);
        assert_eq!(paths, 1);

        driver.remove_monitor_file(path_str).unwrap();
        let (wds, paths, _) = driver.probe_counts();
        assert_eq!(wds, 0);
        assert_eq!(paths, 0);
    }

    #[test]
    fn double_arm_is_rejected() {
        let driver = InotifyDriver::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched");
        std::fs::write(&path, b"x").unwrap();
        let path_str = path.to_str().unwrap();
        driver.add_monitor_file(path_str).unwrap();
        assert!(matches!(driver.add_monitor_file(path_str), Err(DriverError::AlreadyArmed(_))));
    }
}
