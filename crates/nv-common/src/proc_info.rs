use serde::{Deserialize, Serialize};

/// Identity of the process that triggered a file event, as resolved by
/// the host's `PidLookup` callback (§6). Carried verbatim into
/// [`crate::MonitorMessage`] and consulted by the fanotify permission
/// path (§4.4: `{process.path, process.name, parent.path}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcInfo {
    pub pid: u32,
    pub name: String,
    pub path: String,
    pub cmds: Vec<String>,
    pub euid: u32,
    pub euser: String,
    pub ppid: u32,
    pub pname: String,
    pub ppath: String,
}

impl ProcInfo {
    /// Used by the permission path's rule lookup (§4.4): a process is
    /// allowed if any of these three identities appears in the rule set.
    #[must_use]
    pub fn rule_candidates(&self) -> [&str; 3] {
        [self.path.as_str(), self.name.as_str(), self.ppath.as_str()]
    }
}
