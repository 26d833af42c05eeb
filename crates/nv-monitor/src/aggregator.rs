//! Event Aggregator (C5): coalesces repeated notify-channel activity on
//! the same path into a single `FileMod` per flush tick (§4.5).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use nv_common::ProcInfo;

use crate::mask;

/// A single observing process, in arrival order. §4.6 "process
/// deduplication": consecutive duplicates are suppressed by the
/// classifier at flush time, not here — the aggregator keeps every
/// arrival so the classifier can apply that rule itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcObservation {
    pub proc: ProcInfo,
}

/// One path's accumulated, not-yet-flushed state (§3 "FileMod").
#[derive(Debug, Clone)]
pub struct FileMod {
    pub container_id: String,
    pub root_pid: u32,
    /// Path inside the container's filesystem namespace, e.g. `/etc/passwd`
    /// — the same form carried into the outbound `MonitorMessage` (§3).
    pub path: String,
    pub is_dir: bool,
    /// Union of raw kernel event bits observed this window.
    pub raw_mask: u32,
    /// Whether any event this window carried move evidence on an
    /// already-vanished inode (`IN_MOVED_FROM`/`IN_MOVE_SELF`) —
    /// classifier input `inode_moved_mask` (§4.6 "absent path" rule).
    pub inode_moved: bool,
    /// Non-zero content hash recorded when the target was armed, or
    /// `None` if never computed (§9 "Hashing").
    pub prior_hash: Option<u64>,
    pub procs: Vec<ProcObservation>,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

impl FileMod {
    #[allow(clippy::too_many_arguments)]
    fn new(
        container_id: String,
        root_pid: u32,
        path: String,
        is_dir: bool,
        raw_mask: u32,
        inode_moved: bool,
        prior_hash: Option<u64>,
        proc: Option<ProcInfo>,
    ) -> Self {
        let now = Instant::now();
        Self {
            container_id,
            root_pid,
            path,
            is_dir,
            raw_mask,
            inode_moved,
            prior_hash,
            procs: proc.into_iter().map(|proc| ProcObservation { proc }).collect(),
            first_seen: now,
            last_seen: now,
        }
    }

    /// §4.5 "merge rule": `mask |= event_mask`; process info is
    /// appended only when its pid is not already present.
    fn merge(&mut self, raw_mask: u32, inode_moved: bool, proc: Option<ProcInfo>) {
        self.raw_mask |= raw_mask;
        self.inode_moved |= inode_moved;
        if let Some(proc) = proc {
            if !self.procs.iter().any(|p| p.proc.pid == proc.pid) {
                self.procs.push(ProcObservation { proc });
            }
        }
        self.last_seen = Instant::now();
    }

    #[must_use]
    pub fn has(&self, bit: u32) -> bool {
        mask::has(self.raw_mask, bit)
    }
}

#[derive(Default)]
struct Inner {
    // Keyed by (container_id, path): two containers can share a host
    // path prefix (overlayfs lower layers) and must not collide.
    pending: HashMap<(String, String), FileMod>,
}

/// Coalesces notify events during `flush_interval`-wide windows. The
/// caller (the Linux core's background task) is responsible for
/// calling [`Aggregator::flush`] on a ticker; the aggregator itself
/// holds no timer, matching §5's "atomically swaps the map for an
/// empty one" flush pattern.
#[derive(Default)]
pub struct Aggregator {
    inner: Mutex<Inner>,
}

impl Aggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        container_id: &str,
        root_pid: u32,
        path: &str,
        is_dir: bool,
        raw_mask: u32,
        inode_moved: bool,
        prior_hash: Option<u64>,
        proc: Option<ProcInfo>,
    ) {
        let mut inner = self.inner.lock().expect("aggregator mutex poisoned");
        let key = (container_id.to_string(), path.to_string());
        inner
            .pending
            .entry(key)
            .and_modify(|m| m.merge(raw_mask, inode_moved, proc.clone()))
            .or_insert_with(|| {
                FileMod::new(container_id.to_string(), root_pid, path.to_string(), is_dir, raw_mask, inode_moved, prior_hash, proc)
            });
    }

    /// Atomically swaps the whole pending map for an empty one and
    /// returns every accumulated entry (§4.5 "atomically swaps the map
    /// for an empty one").
    pub fn flush(&self) -> Vec<FileMod> {
        let mut inner = self.inner.lock().expect("aggregator mutex poisoned");
        std::mem::take(&mut inner.pending).into_values().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().expect("aggregator mutex poisoned").pending.len()
    }

    /// Drops every pending entry for a container's root-PID path
    /// prefix, used by `ContainerCleanup` (§3 invariant 3, §8 property 3).
    pub fn drop_container(&self, container_id: &str) {
        let mut inner = self.inner.lock().expect("aggregator mutex poisoned");
        inner.pending.retain(|(cid, _), _| cid != container_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc(pid: u32) -> ProcInfo {
        ProcInfo {
            pid,
            name: "cat".into(),
            path: "/bin/cat".into(),
            cmds: vec!["cat".into()],
            euid: 0,
            euser: "root".into(),
            ppid: 1,
            pname: "sh".into(),
            ppath: "/bin/sh".into(),
        }
    }

    #[test]
    fn repeated_events_on_same_path_merge_mask() {
        let agg = Aggregator::new();
        agg.record("c1", 42, "/etc/passwd", false, mask::ATTRIB, false, None, Some(proc(100)));
        agg.record("c1", 42, "/etc/passwd", false, mask::MODIFY, false, None, Some(proc(100)));
        assert_eq!(agg.pending_count(), 1);
        let flushed = agg.flush();
        assert_eq!(flushed.len(), 1);
        assert!(flushed[0].has(mask::ATTRIB));
        assert!(flushed[0].has(mask::MODIFY));
        assert_eq!(flushed[0].procs.len(), 1);
    }

    #[test]
    fn distinct_pids_both_recorded() {
        let agg = Aggregator::new();
        agg.record("c1", 42, "/etc/passwd", false, mask::MODIFY, false, None, Some(proc(100)));
        agg.record("c1", 42, "/etc/passwd", false, mask::MODIFY, false, None, Some(proc(101)));
        let flushed = agg.flush();
        assert_eq!(flushed[0].procs.len(), 2);
    }

    #[test]
    fn distinct_containers_on_same_path_do_not_collide() {
        let agg = Aggregator::new();
        agg.record("c1", 42, "/etc/passwd", false, mask::ATTRIB, false, None, None);
        agg.record("c2", 43, "/etc/passwd", false, mask::ATTRIB, false, None, None);
        assert_eq!(agg.pending_count(), 2);
    }

    #[test]
    fn flush_empties_the_map() {
        let agg = Aggregator::new();
        agg.record("c1", 42, "/etc/passwd", false, mask::ATTRIB, false, None, None);
        assert_eq!(agg.flush().len(), 1);
        assert_eq!(agg.pending_count(), 0);
    }

    #[test]
    fn drop_container_removes_only_its_entries() {
        let agg = Aggregator::new();
        agg.record("c1", 42, "/etc/passwd", false, mask::ATTRIB, false, None, None);
        agg.record("c2", 43, "/etc/passwd", false, mask::ATTRIB, false, None, None);
        agg.drop_container("c1");
        assert_eq!(agg.pending_count(), 1);
    }

    #[test]
    fn inode_moved_flag_is_unioned_across_the_window() {
        let agg = Aggregator::new();
        agg.record("c1", 42, "/etc/passwd", false, mask::DELETE, false, None, None);
        agg.record("c1", 42, "/etc/passwd", false, mask::DELETE, true, None, None);
        let flushed = agg.flush();
        assert!(flushed[0].inode_moved);
    }
}
