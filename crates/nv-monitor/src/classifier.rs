//! Classifier & Reporter (C6): turns one flushed [`FileMod`] into zero
//! or one [`MonitorMessage`] (§4.6).

use nv_common::{Action, EventKind, MonitorMessage, ProcInfo};
use nv_policy::PolicyMode;

use crate::aggregator::FileMod;
use crate::mask;

/// Result of re-`lstat`ing a path after its aggregation window closed.
/// Injected so the classifier is exercisable without a real filesystem.
#[derive(Debug, Clone, Copy)]
pub struct PostEventStat {
    pub exists: bool,
    pub is_symlink: bool,
    pub inode: u64,
    /// Content hash of the current file contents, computed only when
    /// the caller decided it was necessary (§9 "Hashing" — lazy, keyed
    /// by `(inode, size)` as a cheap pre-filter upstream of this call).
    pub content_hash: Option<u64>,
}

pub trait PathStat: Send + Sync {
    fn stat(&self, host_path: &str) -> PostEventStat;
}

/// Static table of paths the container runtime writes at boot (§3
/// "Runtime-added file", §4.6 "special-case suppression").
fn is_runtime_added(path: &str) -> bool {
    nv_common::RUNTIME_ADDED_FILES.contains(&path)
}

/// Whether `path` belongs to a package-manager database. A minimal,
/// name-anchored table; the full table lives with the out-of-scope
/// package-inventory collaborator and is not reproduced here.
fn is_package_db(path: &str) -> bool {
    const PACKAGE_DB_SUFFIXES: [&str; 4] = [
        "/var/lib/dpkg/status",
        "/var/lib/rpm/Packages",
        "/lib/apk/db/installed",
        "/var/lib/pacman/local",
    ];
    PACKAGE_DB_SUFFIXES.iter().any(|suffix| path.starts_with(suffix))
}

/// §4.6 "Directory-event precedence" / the file-event table collapsed
/// into one function, since both share the same mask-driven decision
/// tree modulo the `is_dir` selector on each `EventKind` pair.
#[must_use]
pub fn classify(
    file_mod: &FileMod,
    stat: &PostEventStat,
    inode_moved_mask: bool,
    previously_armed: bool,
) -> Option<EventKind> {
    let is_dir = file_mod.is_dir;

    // MOVED_TO takes precedence over everything else observed in the
    // same window.
    if file_mod.has(mask::MOVED_TO) {
        return Some(if is_dir { EventKind::DirMovedTo } else { EventKind::FileMovedTo });
    }

    if file_mod.has(mask::CREATE) && stat.exists {
        if stat.is_symlink {
            return Some(if is_dir { EventKind::DirSymCreated } else { EventKind::FileSymCreated });
        }
        return Some(if is_dir { EventKind::DirCreated } else { EventKind::FileCreated });
    }

    if !stat.exists {
        // Absent path: MOVED_FROM wins over a plain Removed whenever
        // the raw mask actually carried move evidence.
        if file_mod.has(mask::MOVED_FROM) || inode_moved_mask {
            return Some(if is_dir { EventKind::DirMovedFrom } else { EventKind::FileMovedFrom });
        }
        if (file_mod.has(mask::DELETE) || file_mod.has(mask::DELETE_SELF)) && previously_armed {
            return Some(if is_dir { EventKind::DirRemoved } else { EventKind::FileRemoved });
        }
        // No modification evidence for an already-tracked target, or a
        // path that was created and deleted inside the same window:
        // nothing to report (§8 property 7).
        return None;
    }

    if file_mod.has(mask::ATTRIB) && !file_mod.has(mask::MODIFY) && !file_mod.has(mask::CLOSE_WRITE) {
        return Some(if is_dir { EventKind::DirAttr } else { EventKind::FileAttr });
    }

    if file_mod.has(mask::ACCESS) || file_mod.has(mask::MODIFY) || file_mod.has(mask::CLOSE_WRITE) || file_mod.has(mask::OPEN) {
        if is_dir {
            // Directories have no content hash; a dir-scoped
            // modify/close-write is reported as an attribute change,
            // unless the target itself is a symlink.
            return Some(if stat.is_symlink { EventKind::DirSymModified } else { EventKind::DirAttr });
        }
        if stat.is_symlink {
            return Some(EventKind::FileSymModified);
        }
        let modified = match (file_mod.prior_hash, stat.content_hash) {
            (Some(prior), Some(current)) => prior != current,
            (None, Some(_)) => file_mod.has(mask::MODIFY) || file_mod.has(mask::CLOSE_WRITE),
            _ => false,
        };
        if modified {
            return Some(EventKind::FileModified);
        }
        return Some(EventKind::FileAccessed);
    }

    None
}

/// Outcome of running one [`FileMod`] through the full reporting
/// pipeline: suppression, mode gating, and message construction.
pub enum Verdict {
    Report(MonitorMessage),
    Suppressed,
}

/// §4.6 end to end: classify, apply special-case suppression and mode
/// gating, dedupe the process list, and build the outbound message.
///
/// `group_age_secs` is the originating `GroupInfo`'s age at event time;
/// `group_name` is the matched filter's `derived_group`; `deny` is
/// `true` only when this `FileMod` originated from a fanotify
/// permission denial (`FileDenied` is never derived from the mask
/// table above — it is injected directly by the permission path).
#[allow(clippy::too_many_arguments)]
#[must_use]
pub fn evaluate(
    file_mod: &FileMod,
    stat: &PostEventStat,
    inode_moved_mask: bool,
    previously_armed: bool,
    mode: PolicyMode,
    group_age_secs: u64,
    group_name: &str,
    container_id: &str,
    forced_deny: Option<&ProcInfo>,
) -> Verdict {
    let kind = if forced_deny.is_some() {
        EventKind::FileDenied
    } else {
        match classify(file_mod, stat, inode_moved_mask, previously_armed) {
            Some(kind) => kind,
            None => return Verdict::Suppressed,
        }
    };

    let proc = match forced_deny {
        Some(p) => p.clone(),
        None => match dedup_last_reporter(file_mod) {
            Some(p) => p,
            None => return Verdict::Suppressed,
        },
    };

    if kind.requires_non_learn_mode() && matches!(mode, PolicyMode::Learn) {
        return Verdict::Suppressed;
    }

    if is_runtime_added(&file_mod.path)
        && (matches!(kind, EventKind::FileAccessed) || group_age_secs < nv_common::RUNTIME_FILE_GRACE_SECS)
    {
        return Verdict::Suppressed;
    }

    let action = if matches!(kind, EventKind::FileDenied) { Action::Deny } else { Action::Violate };

    Verdict::Report(MonitorMessage {
        container_id: container_id.to_string(),
        path: file_mod.path.clone(),
        kind,
        proc,
        group: group_name.to_string(),
        package_db: is_package_db(&file_mod.path),
        action,
    })
}

/// §4.6 "process deduplication": consecutive duplicates (by full
/// struct equality) are suppressed; the first occurrence is always
/// reported. The reporter ultimately tags the message with the *last*
/// surviving (i.e. most recent distinct) observer.
fn dedup_last_reporter(file_mod: &FileMod) -> Option<ProcInfo> {
    let mut last: Option<&ProcInfo> = None;
    for obs in &file_mod.procs {
        if last != Some(&obs.proc) {
            last = Some(&obs.proc);
        }
    }
    last.cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nv_common::ProcInfo;

    fn base_mod(raw_mask: u32, is_dir: bool) -> FileMod {
        FileMod {
            container_id: "c1".into(),
            root_pid: 42,
            path: "/etc/passwd".into(),
            is_dir,
            raw_mask,
            inode_moved: false,
            prior_hash: None,
            procs: vec![],
            first_seen: std::time::Instant::now(),
            last_seen: std::time::Instant::now(),
        }
    }

    fn proc(pid: u32) -> ProcInfo {
        ProcInfo {
            pid,
            name: "writer".into(),
            path: "/usr/bin/writer".into(),
            cmds: vec![],
            euid: 0,
            euser: "root".into(),
            ppid: 1,
            pname: "sh".into(),
            ppath: "/bin/sh".into(),
        }
    }

    fn exists(hash: Option<u64>) -> PostEventStat {
        PostEventStat { exists: true, is_symlink: false, inode: 1, content_hash: hash }
    }

    fn gone() -> PostEventStat {
        PostEventStat { exists: false, is_symlink: false, inode: 0, content_hash: None }
    }

    fn with_proc(mut m: FileMod, p: ProcInfo) -> FileMod {
        m.procs.push(crate::aggregator::ProcObservation { proc: p });
        m
    }

    #[test]
    fn text_edit_is_modified() {
        let mut m = base_mod(mask::CLOSE_WRITE | mask::MODIFY, false);
        m.prior_hash = Some(1);
        let stat = exists(Some(2));
        assert_eq!(classify(&m, &stat, false, true), Some(EventKind::FileModified));
    }

    #[test]
    fn create_then_delete_in_one_window_cancels() {
        let m = base_mod(mask::CREATE | mask::DELETE, false);
        let stat = gone();
        // §8 property 7: a path created and deleted inside one window
        // was never "already armed", so the trailing DELETE does not
        // surface as Removed and CREATE never matched a path that
        // turned out not to exist.
        assert_eq!(classify(&m, &stat, false, false), None);
    }

    #[test]
    fn plain_delete_without_move_evidence() {
        let m = base_mod(mask::DELETE, false);
        let stat = gone();
        assert_eq!(classify(&m, &stat, false, true), Some(EventKind::FileRemoved));
    }

    #[test]
    fn delete_of_never_armed_path_is_not_reported() {
        let m = base_mod(mask::DELETE, false);
        let stat = gone();
        assert_eq!(classify(&m, &stat, false, false), None);
    }

    #[test]
    fn moved_from_wins_over_removed_when_inode_moved_mask_set() {
        let m = base_mod(mask::DELETE, false);
        let stat = gone();
        assert_eq!(classify(&m, &stat, true, true), Some(EventKind::FileMovedFrom));
    }

    #[test]
    fn attrib_only_is_attr() {
        let m = base_mod(mask::ATTRIB, false);
        let stat = exists(None);
        assert_eq!(classify(&m, &stat, false, true), Some(EventKind::FileAttr));
    }

    #[test]
    fn dir_modify_on_symlink_target_is_dir_sym_modified() {
        let m = base_mod(mask::MODIFY, true);
        let stat = PostEventStat { exists: true, is_symlink: true, inode: 1, content_hash: None };
        assert_eq!(classify(&m, &stat, false, true), Some(EventKind::DirSymModified));
    }

    #[test]
    fn dir_modify_on_regular_dir_is_dir_attr() {
        let m = base_mod(mask::MODIFY, true);
        let stat = exists(None);
        assert_eq!(classify(&m, &stat, false, true), Some(EventKind::DirAttr));
    }

    #[test]
    fn access_without_modification_is_accessed() {
        let mut m = base_mod(mask::ACCESS, false);
        m.prior_hash = Some(5);
        let stat = exists(Some(5));
        assert_eq!(classify(&m, &stat, false, true), Some(EventKind::FileAccessed));
    }

    #[test]
    fn runtime_added_file_suppressed_within_grace() {
        let mut m = base_mod(mask::CLOSE_WRITE | mask::MODIFY, false);
        m.path = "/etc/hosts".into();
        m = with_proc(m, proc(1));
        let stat = exists(Some(9));
        let verdict = evaluate(&m, &stat, false, true, PolicyMode::Evaluate, 5, "g", "c1", None);
        assert!(matches!(verdict, Verdict::Suppressed));
    }

    #[test]
    fn accessed_suppressed_in_learn_mode() {
        let mut m = base_mod(mask::ACCESS, false);
        m.prior_hash = Some(1);
        m = with_proc(m, proc(1));
        let stat = exists(Some(1));
        let verdict = evaluate(&m, &stat, false, true, PolicyMode::Learn, 1000, "g", "c1", None);
        assert!(matches!(verdict, Verdict::Suppressed));
    }

    #[test]
    fn modified_reported_in_evaluate_mode() {
        let mut m = base_mod(mask::CLOSE_WRITE | mask::MODIFY, false);
        m.prior_hash = Some(1);
        m = with_proc(m, proc(7));
        let stat = exists(Some(2));
        let verdict = evaluate(&m, &stat, false, true, PolicyMode::Evaluate, 1000, "passwd_group", "c1", None);
        match verdict {
            Verdict::Report(msg) => {
                assert_eq!(msg.kind, EventKind::FileModified);
                assert_eq!(msg.action, Action::Violate);
                assert_eq!(msg.proc.pid, 7);
                assert_eq!(msg.group, "passwd_group");
            }
            Verdict::Suppressed => panic!("expected a report"),
        }
    }

    #[test]
    fn forced_deny_always_reports_file_denied() {
        let m = base_mod(0, false);
        let stat = exists(None);
        let denier = proc(9);
        let verdict = evaluate(&m, &stat, false, true, PolicyMode::Enforce, 1000, "g", "c1", Some(&denier));
        match verdict {
            Verdict::Report(msg) => {
                assert_eq!(msg.kind, EventKind::FileDenied);
                assert_eq!(msg.action, Action::Deny);
            }
            Verdict::Suppressed => panic!("expected a deny report"),
        }
    }

    #[test]
    fn no_observing_process_suppresses_report() {
        let m = base_mod(mask::ATTRIB, false);
        let stat = exists(None);
        let verdict = evaluate(&m, &stat, false, true, PolicyMode::Evaluate, 1000, "g", "c1", None);
        assert!(matches!(verdict, Verdict::Suppressed));
    }
}
