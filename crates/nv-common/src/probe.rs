use serde::{Deserialize, Serialize};

/// Snapshot returned by `GetProbeData` (§6): counters useful for
/// health checks and capacity dashboards. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeData {
    pub n_events: u64,
    pub n_groups: usize,
    pub fanotify: FanotifyProbeData,
    pub inotify: InotifyProbeData,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanotifyProbeData {
    pub roots: usize,
    pub mnt_roots: usize,
    pub dir_marks: usize,
    pub rules: usize,
    pub paths: usize,
    pub dirs: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InotifyProbeData {
    pub wds: usize,
    pub paths: usize,
    pub dirs: usize,
}
