use serde::{Deserialize, Serialize};

use crate::ProcInfo;

/// The full event taxonomy (§4.6) — the only event kinds the classifier
/// ever emits. Variant order follows the table in §4.6 top to bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    FileAttr,
    DirAttr,
    FileCreated,
    DirCreated,
    FileRemoved,
    DirRemoved,
    FileModified,
    FileReplaced,
    FileAccessed,
    FileDenied,
    FileMovedFrom,
    FileMovedTo,
    DirMovedFrom,
    DirMovedTo,
    FileSymCreated,
    FileSymModified,
    DirSymCreated,
    DirSymModified,
}

impl EventKind {
    /// The canonical human-readable message string (§4.6 table, used
    /// verbatim by E1/E2 in §8).
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            EventKind::FileAttr | EventKind::DirAttr => "File attribute was changed.",
            EventKind::FileCreated => "File was created.",
            EventKind::DirCreated => "Directory was created.",
            EventKind::FileRemoved => "File was removed.",
            EventKind::DirRemoved => "Directory was removed.",
            EventKind::FileModified => "File was modified.",
            EventKind::FileReplaced => "File was replaced.",
            EventKind::FileAccessed => "File was accessed.",
            EventKind::FileDenied => "File access was denied.",
            EventKind::FileMovedFrom => "File was moved away.",
            EventKind::FileMovedTo => "File was moved in.",
            EventKind::DirMovedFrom => "Directory was moved away.",
            EventKind::DirMovedTo => "Directory was moved in.",
            EventKind::FileSymCreated => "Symlink was created.",
            EventKind::FileSymModified => "Symlink was modified.",
            EventKind::DirSymCreated => "Directory symlink was created.",
            EventKind::DirSymModified => "Directory symlink was modified.",
        }
    }

    /// Whether this kind is only ever emitted while the originating
    /// group is in `Enforce` or `Evaluate` mode (§4.6 "mode gating").
    #[must_use]
    pub fn requires_non_learn_mode(self) -> bool {
        matches!(self, EventKind::FileAccessed)
    }
}

/// Resulting action attached to a [`MonitorMessage`] (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// A monitored access was observed and reported, but not blocked.
    Violate,
    /// A blocked access was denied at the kernel boundary (§4.4).
    Deny,
}

/// Outbound alert (§3 "MonitorMessage"). Produced by the classifier
/// (C6) and handed to the `SendReport` callback (§6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorMessage {
    pub container_id: String,
    pub path: String,
    pub kind: EventKind,
    pub proc: ProcInfo,
    /// The filter-derived group name the path matched (§3 "derived_group").
    pub group: String,
    /// True when `path` belongs to a package-manager database (derived
    /// from a static path table, §3).
    pub package_db: bool,
    pub action: Action,
}

impl MonitorMessage {
    #[must_use]
    pub fn text(&self) -> &'static str {
        self.kind.message()
    }
}
