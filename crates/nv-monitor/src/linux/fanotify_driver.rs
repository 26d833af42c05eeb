//! Fanotify Driver (C4): arms fanotify marks and services permission
//! events synchronously (§4.4). No safe fanotify wrapper exists in the
//! registry, so this module talks to the kernel directly through
//! `libc`, matching how the rest of the corpus reaches for raw FFI
//! only where a crate genuinely doesn't cover the syscall.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::callbacks::PidLookup;
use crate::error::DriverError;
use crate::mask;
use crate::registry::{GroupRegistry, ModeBundle};

// Constants not exposed by `libc` for older glibc headers on some
// build targets; values match `<sys/fanotify.h>`.
const FAN_CLASS_CONTENT: u32 = 0x0000_0004;
const FAN_CLASS_NOTIF: u32 = 0x0000_0000;
const FAN_CLOEXEC: u32 = 0x0000_0001;
const FAN_NONBLOCK: u32 = 0x0000_0002;
const FAN_MARK_ADD: u32 = 0x0000_0001;
const FAN_MARK_REMOVE: u32 = 0x0000_0002;
const FAN_MARK_MOUNT: u32 = 0x0000_0010;
const FAN_OPEN: u64 = 0x0000_0020;
const FAN_OPEN_PERM: u64 = 0x0001_0000;
const FAN_ACCESS_PERM: u64 = 0x0002_0000;
const FAN_ALLOW: u32 = 0x01;
const FAN_DENY: u32 = 0x02;
const FAN_EVENT_METADATA_LEN: usize = 24;

#[repr(C)]
struct FanotifyEventMetadata {
    event_len: u32,
    vers: u8,
    reserved: u8,
    metadata_len: u16,
    mask: u64,
    fd: i32,
    pid: i32,
}

#[repr(C)]
struct FanotifyResponse {
    fd: i32,
    response: u32,
}

extern "C" {
    fn fanotify_init(flags: u32, event_f_flags: u32) -> i32;
    fn fanotify_mark(fanotify_fd: i32, flags: u32, mask: u64, dirfd: i32, pathname: *const libc::c_char) -> i32;
}

/// `(access, perm)` → arming mask for one path, per §4.4.
fn arm_mask(bundle: ModeBundle, perm_supported: bool) -> u64 {
    let mut m = 0u64;
    if bundle.access {
        m |= FAN_OPEN;
    }
    if bundle.perm && perm_supported {
        m |= FAN_OPEN_PERM | FAN_ACCESS_PERM;
    }
    m
}

struct MarkTable {
    // path -> mask currently armed, so re-arming with a superset mask
    // is a no-op detection point and `RemoveMonitorFile` knows what to
    // clear.
    marks: HashMap<String, u64>,
    dir_marks: usize,
    mnt_roots: usize,
    roots: usize,
}

impl MarkTable {
    fn new() -> Self {
        Self { marks: HashMap::new(), dir_marks: 0, mnt_roots: 0, roots: 0 }
    }
}

/// One permission decision the synchronous path must render (§4.4,
/// §5 "Permission callbacks MUST complete before their enclosing
/// kernel event returns").
pub struct PermissionVerdict {
    pub allow: bool,
    pub emit_deny_report: bool,
}

/// One notify delivery handed to the aggregator, mirroring
/// [`crate::linux::inotify_driver::InotifyDelivery`]'s shape.
#[derive(Debug, Clone)]
pub struct FanotifyDelivery {
    pub path: String,
    pub raw_mask: u32,
    pub pid: u32,
}

/// A deny decision forwarded for reporting once the synchronous
/// permission response has already gone back to the kernel. Reporting
/// never blocks the decision itself (§9 "Permission-event
/// back-pressure" — emit notify/deny events via the aggregator only).
#[derive(Debug, Clone)]
pub struct DenyDelivery {
    pub path: String,
    pub pid: u32,
    pub container_id: String,
}

pub enum FanotifyEvent {
    Notify(FanotifyDelivery),
    Denied(DenyDelivery),
}

/// Resolves the path behind an event's borrowed fd via `/proc/self/fd`,
/// matching the kernel's own fd-to-path contract for fanotify events.
/// Must be called before the fd is closed.
fn resolve_fd_path(fd: i32) -> Option<String> {
    std::fs::read_link(format!("/proc/self/fd/{fd}"))
        .ok()
        .and_then(|p| p.into_os_string().into_string().ok())
}

pub struct FanotifyDriver {
    fd: RawFd,
    perm_supported: bool,
    table: Mutex<MarkTable>,
    pid_lookup: Arc<dyn PidLookup>,
    registry: Arc<GroupRegistry>,
}

impl FanotifyDriver {
    /// Opens the fanotify group. Falls back from `FAN_CLASS_CONTENT`
    /// (permission-capable) to `FAN_CLASS_NOTIF` when the kernel
    /// refuses the former, marking the driver `perm_supported=false`
    /// for the lifetime of the process (§7 "kernel-unsupported").
    ///
    /// `registry` is consulted directly from the reader thread so a
    /// permission decision never leaves this process's synchronous call
    /// stack before `respond` is written back to the kernel (§5).
    pub fn new(pid_lookup: Arc<dyn PidLookup>, registry: Arc<GroupRegistry>) -> Result<Self, DriverError> {
        // SAFETY: `fanotify_init` is called with no pointers; its
        // return value is checked below before use.
        let fd = unsafe { fanotify_init(FAN_CLASS_CONTENT | FAN_CLOEXEC | FAN_NONBLOCK, libc::O_RDONLY as u32) };
        if fd >= 0 {
            return Ok(Self { fd, perm_supported: true, table: Mutex::new(MarkTable::new()), pid_lookup, registry });
        }

        // SAFETY: same as above; this call is only reached when the
        // first attempt failed.
        let fd = unsafe { fanotify_init(FAN_CLASS_NOTIF | FAN_CLOEXEC | FAN_NONBLOCK, libc::O_RDONLY as u32) };
        if fd >= 0 {
            return Ok(Self { fd, perm_supported: false, table: Mutex::new(MarkTable::new()), pid_lookup, registry });
        }
        Err(DriverError::Errno(nix::errno::Errno::last()))
    }

    #[must_use]
    pub fn perm_supported(&self) -> bool {
        self.perm_supported
    }

    fn mark(&self, path: &str, flags: u32, m: u64) -> Result<(), DriverError> {
        let c_path = std::ffi::CString::new(path).map_err(|_| DriverError::NotArmed(path.to_string()))?;
        // SAFETY: `c_path` is a valid, NUL-terminated C string owned by
        // this stack frame for the duration of the call; `self.fd` is
        // a valid fanotify descriptor.
        let rc = unsafe { fanotify_mark(self.fd, flags, m, libc::AT_FDCWD, c_path.as_ptr()) };
        if rc != 0 {
            return Err(DriverError::Errno(nix::errno::Errno::last()));
        }
        Ok(())
    }

    /// §4.4 `AddMonitorFile`.
    pub fn add_monitor_file(&self, path: &str, bundle: ModeBundle) -> Result<(), DriverError> {
        let m = arm_mask(bundle, self.perm_supported);
        self.mark(path, FAN_MARK_ADD, m)?;
        let mut table = self.table.lock().expect("fanotify mark table mutex poisoned");
        table.marks.insert(path.to_string(), m);
        Ok(())
    }

    /// §4.4 `AddMonitorDirFile`.
    pub fn add_monitor_dir_file(&self, path: &str, bundle: ModeBundle) -> Result<(), DriverError> {
        let m = arm_mask(bundle, self.perm_supported);
        self.mark(path, FAN_MARK_ADD, m)?;
        let mut table = self.table.lock().expect("fanotify mark table mutex poisoned");
        table.marks.insert(path.to_string(), m);
        table.dir_marks += 1;
        Ok(())
    }

    /// §4.4 `StartMonitor(rootPid)`: arm the container's mount point so
    /// notify events from any path under it are observable even before
    /// per-file marks are placed.
    pub fn start_monitor(&self, mount_path: &str, bundle: ModeBundle) -> Result<(), DriverError> {
        let m = arm_mask(bundle, self.perm_supported);
        self.mark(mount_path, FAN_MARK_ADD | FAN_MARK_MOUNT, m)?;
        let mut table = self.table.lock().expect("fanotify mark table mutex poisoned");
        table.mnt_roots += 1;
        table.roots += 1;
        Ok(())
    }

    /// §4.4 `RemoveMonitorFile`.
    pub fn remove_monitor_file(&self, path: &str) -> Result<(), DriverError> {
        let mut table = self.table.lock().expect("fanotify mark table mutex poisoned");
        let m = table.marks.remove(path).ok_or_else(|| DriverError::NotArmed(path.to_string()))?;
        drop(table);
        // Best-effort: ENOENT here means the path is already gone,
        // which is not-applicable (§7) and swallowed.
        let _ = self.mark(path, FAN_MARK_REMOVE, m);
        Ok(())
    }

    /// §6 `GetProbeData`: `(roots, mntRoots, dirMarks, paths)`.
    #[must_use]
    pub fn probe_counts(&self) -> (usize, usize, usize, usize) {
        let table = self.table.lock().expect("fanotify mark table mutex poisoned");
        (table.roots, table.mnt_roots, table.dir_marks, table.marks.len())
    }

    /// §4.4 `GetWatchFileList(rootPid)`: every path currently armed
    /// under one container's proc-root prefix.
    #[must_use]
    pub fn watch_file_list(&self, proc_root_prefix: &str) -> Vec<String> {
        let table = self.table.lock().expect("fanotify mark table mutex poisoned");
        table.marks.keys().filter(|p| p.starts_with(proc_root_prefix)).cloned().collect()
    }

    /// §4.4 `GetWatches`: every path armed across all containers.
    #[must_use]
    pub fn get_watches(&self) -> Vec<String> {
        let table = self.table.lock().expect("fanotify mark table mutex poisoned");
        table.marks.keys().cloned().collect()
    }

    /// §4.4 `ContainerCleanup(rootPid)`: release every mark under this
    /// container's proc-root prefix. Best-effort: a mark whose backing
    /// path is already gone returns ENOENT, which is not-applicable
    /// (§7) and is swallowed.
    pub fn container_cleanup(&self, proc_root_prefix: &str) {
        let doomed: Vec<(String, u64)> = {
            let table = self.table.lock().expect("fanotify mark table mutex poisoned");
            table
                .marks
                .iter()
                .filter(|(p, _)| p.starts_with(proc_root_prefix))
                .map(|(p, m)| (p.clone(), *m))
                .collect()
        };
        for (path, m) in &doomed {
            let _ = self.mark(path, FAN_MARK_REMOVE, *m);
        }
        let mut table = self.table.lock().expect("fanotify mark table mutex poisoned");
        for (path, _) in doomed {
            table.marks.remove(&path);
        }
    }

    /// Decides `ALLOW`/`DENY` for one permission event (§4.4). Runs on
    /// the reader's dedicated worker pool and never touches the
    /// aggregator or report callback (§9 "Permission-event
    /// back-pressure").
    #[must_use]
    pub fn decide(
        &self,
        pid: u32,
        apply_rules_for_filter: Option<&std::collections::HashSet<String>>,
        cap_block: bool,
    ) -> PermissionVerdict {
        // Fail-open: no identity, no verdict pipeline, or shutdown in
        // progress all default to ALLOW (§7).
        let Some(proc) = self.pid_lookup.lookup(pid) else {
            return PermissionVerdict { allow: true, emit_deny_report: false };
        };
        let Some(rules) = apply_rules_for_filter else {
            return PermissionVerdict { allow: true, emit_deny_report: false };
        };
        let allowed = proc.rule_candidates().iter().any(|candidate| rules.contains(*candidate));
        if allowed {
            return PermissionVerdict { allow: true, emit_deny_report: false };
        }
        if cap_block {
            PermissionVerdict { allow: false, emit_deny_report: true }
        } else {
            // Evaluate mode: allow, but still worth reporting a Violate.
            PermissionVerdict { allow: true, emit_deny_report: true }
        }
    }

    /// Resolves `host_path`'s group/rules from the registry and runs
    /// [`Self::decide`] — the one registry round-trip the permission
    /// path makes (§5: "holds no locks other than a short read of
    /// `apply_rules`").
    #[must_use]
    fn decide_for_path(&self, pid: u32, host_path: &str) -> (PermissionVerdict, Option<String>) {
        match self.registry.permission_lookup(host_path) {
            Some((container_id, rules, cap_block)) => {
                (self.decide(pid, Some(&rules), cap_block), Some(container_id))
            }
            // No group claims this path: fail-open, nothing to report.
            None => (PermissionVerdict { allow: true, emit_deny_report: false }, None),
        }
    }

    /// Writes `FAN_ALLOW`/`FAN_DENY` back to the kernel for one
    /// permission event (§4.4).
    pub fn respond(&self, event_fd: i32, allow: bool) {
        let response = FanotifyResponse { fd: event_fd, response: if allow { FAN_ALLOW } else { FAN_DENY } };
        // SAFETY: `response` is a valid, correctly-sized struct; `self.fd`
        // is the fanotify descriptor this response belongs to.
        unsafe {
            let _ = libc::write(
                self.fd,
                std::ptr::addr_of!(response).cast::<libc::c_void>(),
                std::mem::size_of::<FanotifyResponse>(),
            );
        }
    }

    fn to_raw_mask(m: u64) -> u32 {
        let mut out = 0;
        if m & FAN_OPEN != 0 {
            out |= mask::OPEN;
        }
        out
    }

    /// Spawns the dedicated reader/worker pool (§5). Permission events
    /// are resolved and answered inline on this thread — the registry
    /// lookup is a single short mutex section, not an async hop — so
    /// the kernel's response budget is never at the mercy of the
    /// aggregator or report callback (§9).
    pub fn listen(self: Arc<Self>) -> ReceiverStream<FanotifyEvent> {
        let (tx, rx) = mpsc::channel(1024);
        let driver = self;
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                // SAFETY: `buf` outlives the call and `n` is bounds-checked
                // against its length before any read.
                let n = unsafe { libc::read(driver.fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
                if n <= 0 {
                    let errno = nix::errno::Errno::last();
                    if errno == nix::errno::Errno::EAGAIN {
                        std::thread::sleep(std::time::Duration::from_millis(50));
                        continue;
                    }
                    break;
                }
                let mut offset = 0usize;
                while offset + FAN_EVENT_METADATA_LEN <= n as usize {
                    // SAFETY: bounds-checked above; the kernel guarantees
                    // metadata records are correctly aligned and sized.
                    let meta = unsafe { std::ptr::read_unaligned(buf.as_ptr().add(offset).cast::<FanotifyEventMetadata>()) };
                    let is_perm = meta.mask & (FAN_OPEN_PERM | FAN_ACCESS_PERM) != 0;
                    let pid = meta.pid as u32;
                    if is_perm {
                        let host_path = resolve_fd_path(meta.fd).unwrap_or_default();
                        let (verdict, container_id) = driver.decide_for_path(pid, &host_path);
                        driver.respond(meta.fd, verdict.allow);
                        if verdict.emit_deny_report {
                            if let Some(container_id) = container_id {
                                let _ = tx.blocking_send(FanotifyEvent::Denied(DenyDelivery {
                                    path: host_path,
                                    pid,
                                    container_id,
                                }));
                            }
                        }
                    } else {
                        let host_path = resolve_fd_path(meta.fd).unwrap_or_default();
                        if tx
                            .blocking_send(FanotifyEvent::Notify(FanotifyDelivery {
                                path: host_path,
                                raw_mask: Self::to_raw_mask(meta.mask),
                                pid,
                            }))
                            .is_err()
                        {
                            return;
                        }
                    }
                    // SAFETY: `meta.fd` was produced by the kernel for
                    // this event and is owned by this reader until closed.
                    unsafe {
                        libc::close(meta.fd);
                    }
                    offset += meta.event_len as usize;
                }
            }
        });
        ReceiverStream::new(rx)
    }
}
