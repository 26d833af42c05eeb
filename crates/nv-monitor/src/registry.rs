//! Group Registry (C8): per-container monitoring state, keyed by root
//! PID (§3 "GroupInfo", §4.8).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Instant;

use nv_policy::{CompiledProfile, PolicyMode};

use crate::error::MonitorError;

/// §4.4: the access/perm/capBlock bundle a `GroupInfo` resolves to at
/// `StartWatch` time, consumed by the fanotify driver to decide which
/// event classes to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeBundle {
    /// Request `FAN_OPEN` notify events.
    pub access: bool,
    /// Request permission events (`FAN_OPEN_PERM`/`FAN_ACCESS_PERM`).
    pub perm: bool,
    /// Permitted to respond `FAN_DENY`.
    pub cap_block: bool,
}

/// §3 "GroupInfo".
pub struct GroupInfo {
    pub container_id: String,
    pub root_pid: u32,
    pub is_nv_service: bool,
    pub profile: CompiledProfile,
    pub mode: PolicyMode,
    pub mode_bundle: ModeBundle,
    pub apply_rules: HashMap<String, HashSet<String>>,
    pub learn_rules: HashMap<String, HashSet<String>>,
    pub start_at: Instant,
}

impl GroupInfo {
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.start_at.elapsed()
    }

    /// §4.8: access-rule processing never applies to the host or to
    /// the agent's own container.
    #[must_use]
    pub fn participates_in_access_rules(&self) -> bool {
        self.root_pid != 1 && !self.is_nv_service
    }
}

/// §4.8: compute the initial `ModeBundle` for a new group.
#[must_use]
pub fn compute_mode_bundle(
    root_pid: u32,
    is_nv_service: bool,
    mode: PolicyMode,
    cap_block_requested: bool,
    is_aufs: bool,
) -> ModeBundle {
    // §9 "AUFS quirk": permission enforcement is disabled regardless of
    // profile when the container's filesystem is AUFS.
    let perm = matches!(mode, PolicyMode::Enforce) && !is_aufs && cap_block_requested;
    // `Evaluate` also needs `FAN_OPEN` notify events armed: it's the
    // only channel that carries a pid, and without it a `Monitor`
    // filter's violations can never be attributed to a process (E1).
    let access = root_pid != 1 && !is_nv_service && matches!(mode, PolicyMode::Learn | PolicyMode::Evaluate);
    ModeBundle {
        access,
        perm,
        cap_block: cap_block_requested,
    }
}

#[derive(Default)]
struct Inner {
    groups: HashMap<u32, GroupInfo>,
}

/// Thread-safe registry of active monitoring groups. A single mutex
/// guards membership, matching the spec's "exactly one mutex protects
/// `groups`" (§5).
#[derive(Default)]
pub struct GroupRegistry {
    inner: Mutex<Inner>,
}

impl GroupRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// §3 "Lifecycle": `StartWatch(id, rootPid, conf)`. A second call
    /// for an already-started `root_pid` with the same profile is a
    /// no-op apart from refreshing the profile (§8 round-trip property 6
    /// — mark sets are re-derived idempotently by the drivers, not here).
    pub fn start_watch(
        &self,
        container_id: &str,
        root_pid: u32,
        profile: CompiledProfile,
        mode: Option<PolicyMode>,
        is_nv_service: bool,
        cap_block_requested: bool,
        is_aufs: bool,
    ) {
        let mode = mode.unwrap_or_default();
        let mode_bundle =
            compute_mode_bundle(root_pid, is_nv_service, mode, cap_block_requested, is_aufs);
        let mut inner = self.inner.lock().expect("group registry mutex poisoned");
        inner.groups.insert(
            root_pid,
            GroupInfo {
                container_id: container_id.to_string(),
                root_pid,
                is_nv_service,
                profile,
                mode,
                mode_bundle,
                apply_rules: HashMap::new(),
                learn_rules: HashMap::new(),
                start_at: Instant::now(),
            },
        );
    }

    /// §3 "Lifecycle": `ContainerCleanup(rootPid, bLeave)`. When
    /// `leave` is true the group is removed entirely; otherwise its
    /// rule sets are reset but the group (and its profile/mode) is kept.
    pub fn container_cleanup(&self, root_pid: u32, leave: bool) {
        let mut inner = self.inner.lock().expect("group registry mutex poisoned");
        if leave {
            inner.groups.remove(&root_pid);
        } else if let Some(group) = inner.groups.get_mut(&root_pid) {
            group.apply_rules.clear();
            group.learn_rules.clear();
        }
    }

    pub fn update_access_rules(
        &self,
        root_pid: u32,
        rules: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), MonitorError> {
        let mut inner = self.inner.lock().expect("group registry mutex poisoned");
        let group = inner
            .groups
            .get_mut(&root_pid)
            .ok_or(MonitorError::UnknownGroup(root_pid))?;
        for (filter_key, process_path) in rules {
            group.apply_rules.entry(filter_key.clone()).or_default().insert(process_path.clone());
            // §3 invariant: learn_rules and apply_rules stay disjoint.
            if let Some(learned) = group.learn_rules.get_mut(&filter_key) {
                learned.remove(&process_path);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("group registry mutex poisoned").groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// §6 `GetProbeData`'s `fan.rules` counter: total applied-rule
    /// entries across every active group's `apply_rules` sets.
    #[must_use]
    pub fn total_apply_rules(&self) -> usize {
        let inner = self.inner.lock().expect("group registry mutex poisoned");
        inner.groups.values().map(|g| g.apply_rules.values().map(HashSet::len).sum::<usize>()).sum()
    }

    pub fn contains(&self, root_pid: u32) -> bool {
        self.inner.lock().expect("group registry mutex poisoned").groups.contains_key(&root_pid)
    }

    /// Runs `f` with read/write access to one group's state. Returns
    /// `None` when `root_pid` has no active group.
    pub fn with_group_mut<R>(&self, root_pid: u32, f: impl FnOnce(&mut GroupInfo) -> R) -> Option<R> {
        let mut inner = self.inner.lock().expect("group registry mutex poisoned");
        inner.groups.get_mut(&root_pid).map(f)
    }

    pub fn with_group<R>(&self, root_pid: u32, f: impl FnOnce(&GroupInfo) -> R) -> Option<R> {
        let inner = self.inner.lock().expect("group registry mutex poisoned");
        inner.groups.get(&root_pid).map(f)
    }

    /// Finds which group's profile a given host path belongs to, and
    /// the matching filter key, by scanning active groups. Used by the
    /// classifier/learning engine when a `FileMod`/permission event
    /// doesn't already carry a resolved group (§6 "EstimateRuleSrc"
    /// fallback path).
    pub fn find_group_for_path(&self, in_container_path: &str) -> Option<(u32, String, String)> {
        let inner = self.inner.lock().expect("group registry mutex poisoned");
        for (root_pid, group) in &inner.groups {
            if let Some(filter) = group.profile.matching(in_container_path) {
                return Some((*root_pid, group.container_id.clone(), filter.filter_key()));
            }
        }
        None
    }

    /// The fanotify permission path's one lookup (§4.4, §5 "the
    /// permission code path holds no locks other than a short read of
    /// `apply_rules`"): strip `host_path` down to its in-container form
    /// under whichever group's proc-root prefix matches, resolve its
    /// filter, rule set, and the group's `cap_block` flag, all in a
    /// single short critical section.
    #[must_use]
    pub fn permission_lookup(&self, host_path: &str) -> Option<(String, HashSet<String>, bool)> {
        let inner = self.inner.lock().expect("group registry mutex poisoned");
        for (root_pid, group) in &inner.groups {
            let prefix = format!("/proc/{root_pid}/root");
            let Some(in_container_path) = host_path.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if let Some(filter) = group.profile.matching(in_container_path) {
                let key = filter.filter_key();
                let rules = group.apply_rules.get(&key).cloned().unwrap_or_default();
                return Some((group.container_id.clone(), rules, group.mode_bundle.cap_block));
            }
        }
        None
    }

    /// A notify-path host path, resolved to its owning group and
    /// matched filter (§6 "Kernel interfaces": "Paths are always
    /// addressed as `/proc/<pid>/root/<container-path>`"). Used by both
    /// drivers' event paths, which only ever see host paths.
    #[must_use]
    pub fn resolve_host_path(&self, host_path: &str) -> Option<ResolvedPath> {
        let inner = self.inner.lock().expect("group registry mutex poisoned");
        for (root_pid, group) in &inner.groups {
            let prefix = format!("/proc/{root_pid}/root");
            let Some(in_container_path) = host_path.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if let Some(filter) = group.profile.matching(in_container_path) {
                return Some(ResolvedPath {
                    root_pid: *root_pid,
                    container_id: group.container_id.clone(),
                    in_container_path: in_container_path.to_string(),
                    filter_key: filter.filter_key(),
                    customer_added: filter.filter().customer_added,
                });
            }
        }
        None
    }
}

/// Result of [`GroupRegistry::resolve_host_path`].
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    pub root_pid: u32,
    pub container_id: String,
    pub in_container_path: String,
    pub filter_key: String,
    pub customer_added: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use nv_policy::{Behavior, Filter, Profile};

    fn profile() -> CompiledProfile {
        CompiledProfile::compile(&Profile {
            filters: vec![Filter {
                path: "/etc/shadow".into(),
                regex: String::new(),
                recursive: false,
                behavior: Behavior::Block,
                customer_added: false,
                derived_group: "g".into(),
            }],
        })
        .unwrap()
    }

    #[test]
    fn start_watch_then_cleanup_removes_group() {
        let reg = GroupRegistry::new();
        reg.start_watch("c1", 42, profile(), None, false, true, false);
        assert!(reg.contains(42));
        reg.container_cleanup(42, true);
        assert!(!reg.contains(42));
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn cleanup_without_leave_keeps_group_but_resets_rules() {
        let reg = GroupRegistry::new();
        reg.start_watch("c1", 42, profile(), None, false, true, false);
        reg.update_access_rules(42, [("k".to_string(), "p".to_string())]).unwrap();
        reg.container_cleanup(42, false);
        assert!(reg.contains(42));
        reg.with_group(42, |g| {
            assert!(g.apply_rules.is_empty());
        });
    }

    #[test]
    fn total_apply_rules_sums_across_groups() {
        let reg = GroupRegistry::new();
        reg.start_watch("c1", 42, profile(), None, false, true, false);
        reg.start_watch("c2", 43, profile(), None, false, true, false);
        reg.update_access_rules(42, [("k".to_string(), "p1".to_string()), ("k".to_string(), "p2".to_string())]).unwrap();
        reg.update_access_rules(43, [("k".to_string(), "p3".to_string())]).unwrap();
        assert_eq!(reg.total_apply_rules(), 3);
    }

    #[test]
    fn learn_and_apply_rules_stay_disjoint() {
        let reg = GroupRegistry::new();
        reg.start_watch("c1", 42, profile(), None, false, true, false);
        reg.with_group_mut(42, |g| {
            g.learn_rules
                .entry("k".into())
                .or_default()
                .insert("p".into());
        });
        reg.update_access_rules(42, [("k".to_string(), "p".to_string())]).unwrap();
        reg.with_group(42, |g| {
            assert!(!g.learn_rules.get("k").unwrap().contains("p"));
            assert!(g.apply_rules.get("k").unwrap().contains("p"));
        });
    }

    #[test]
    fn host_and_own_container_never_get_access_processing() {
        assert!(!compute_mode_bundle(1, false, PolicyMode::Learn, true, false).access);
        assert!(!compute_mode_bundle(42, true, PolicyMode::Learn, true, false).access);
        assert!(compute_mode_bundle(42, false, PolicyMode::Learn, true, false).access);
    }

    #[test]
    fn evaluate_mode_also_arms_access_for_process_attribution() {
        // Without `FAN_OPEN` armed, an `Evaluate`-mode group's `Monitor`
        // filters could never attribute a violation to a process.
        assert!(compute_mode_bundle(42, false, PolicyMode::Evaluate, false, false).access);
        assert!(!compute_mode_bundle(42, false, PolicyMode::Enforce, true, false).access);
    }

    #[test]
    fn aufs_disables_perm_regardless_of_mode() {
        let bundle = compute_mode_bundle(42, false, PolicyMode::Enforce, true, true);
        assert!(!bundle.perm);
    }

    #[test]
    fn enforce_with_cap_block_enables_perm_off_aufs() {
        let bundle = compute_mode_bundle(42, false, PolicyMode::Enforce, true, false);
        assert!(bundle.perm);
    }

    #[test]
    fn permission_lookup_strips_proc_root_prefix_before_matching() {
        let reg = GroupRegistry::new();
        reg.start_watch("c1", 42, profile(), None, false, true, false);
        reg.update_access_rules(42, [("/etc/shadow/".to_string(), "/usr/bin/cat".to_string())]).unwrap();
        let (container_id, rules, cap_block) = reg.permission_lookup("/proc/42/root/etc/shadow").unwrap();
        assert_eq!(container_id, "c1");
        assert!(rules.contains("/usr/bin/cat"));
        assert!(cap_block);
        assert!(reg.permission_lookup("/etc/shadow").is_none());
    }

    #[test]
    fn resolve_host_path_returns_in_container_path_and_filter_key() {
        let reg = GroupRegistry::new();
        reg.start_watch("c1", 42, profile(), None, false, true, false);
        let resolved = reg.resolve_host_path("/proc/42/root/etc/shadow").unwrap();
        assert_eq!(resolved.root_pid, 42);
        assert_eq!(resolved.in_container_path, "/etc/shadow");
        assert_eq!(resolved.filter_key, "/etc/shadow/");
    }
}
