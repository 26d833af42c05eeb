//! Learning Engine (C7): records `(filter_key → set<process_path>)`
//! while a group is in `Learn` mode and periodically ships the delta
//! through the rule callback (§4.7).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use nv_common::Rule;
use nv_policy::PolicyMode;

/// One learned delta ready to leave the process, matching §6
/// `SendAccessRule`'s `(group, filter_key, process_path)` triple.
#[must_use]
pub fn to_rules(group: &str, learned: &HashMap<String, HashSet<String>>) -> Vec<Rule> {
    let mut rules = Vec::new();
    for (filter_key, procs) in learned {
        for process_path in procs {
            rules.push(Rule::new(group.to_string(), filter_key.clone(), process_path.clone()));
        }
    }
    rules
}

#[derive(Default)]
struct Inner {
    // Keyed by root PID; mirrors `GroupInfo.learn_rules` but the engine
    // keeps its own accumulation buffer so a flush never has to hold
    // the registry's lock for the whole tick.
    pending: HashMap<u32, HashMap<String, HashSet<String>>>,
}

/// Accumulates learned rules independently of [`crate::registry::GroupRegistry`]
/// and flushes them on a fixed tick. The core is responsible for also
/// mirroring accepted entries into each `GroupInfo.learn_rules` so the
/// disjointness invariant (§3) can be checked against `apply_rules`
/// from one place.
#[derive(Default)]
pub struct LearningEngine {
    inner: Mutex<Inner>,
}

impl LearningEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one observation. `mode` gates this at the call site:
    /// the core only calls `observe` for groups currently in `Learn`
    /// mode (§4.7 "only when mode == Learn"). `already_applied` should
    /// reflect whether `process_path` is already present in
    /// `apply_rules[filter_key]` for this group — such entries are
    /// never (re-)learned (§3 invariant 2).
    pub fn observe(&self, root_pid: u32, mode: PolicyMode, filter_key: &str, process_path: &str, already_applied: bool) {
        if !matches!(mode, PolicyMode::Learn) || already_applied {
            return;
        }
        let mut inner = self.inner.lock().expect("learning engine mutex poisoned");
        inner
            .pending
            .entry(root_pid)
            .or_default()
            .entry(filter_key.to_string())
            .or_default()
            .insert(process_path.to_string());
    }

    /// Swaps the whole pending map for an empty one and returns each
    /// group's delta (§4.7 "a 10-second ticker swaps learn_rules for an
    /// empty map").
    pub fn flush(&self) -> HashMap<u32, HashMap<String, HashSet<String>>> {
        let mut inner = self.inner.lock().expect("learning engine mutex poisoned");
        std::mem::take(&mut inner.pending)
    }

    pub fn drop_group(&self, root_pid: u32) {
        self.inner.lock().expect("learning engine mutex poisoned").pending.remove(&root_pid);
    }

    #[cfg(test)]
    fn pending_len(&self, root_pid: u32) -> usize {
        self.inner
            .lock()
            .unwrap()
            .pending
            .get(&root_pid)
            .map(|m| m.values().map(HashSet::len).sum())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_only_records_in_learn_mode() {
        let engine = LearningEngine::new();
        engine.observe(42, PolicyMode::Enforce, "/bin/.*", "/usr/bin/foo", false);
        assert_eq!(engine.pending_len(42), 0);
        engine.observe(42, PolicyMode::Learn, "/bin/.*", "/usr/bin/foo", false);
        assert_eq!(engine.pending_len(42), 1);
    }

    #[test]
    fn observe_skips_already_applied_process_paths() {
        let engine = LearningEngine::new();
        engine.observe(42, PolicyMode::Learn, "/bin/.*", "/usr/bin/foo", true);
        assert_eq!(engine.pending_len(42), 0);
    }

    #[test]
    fn repeated_observation_deduplicates() {
        let engine = LearningEngine::new();
        engine.observe(42, PolicyMode::Learn, "/bin/.*", "/usr/bin/foo", false);
        engine.observe(42, PolicyMode::Learn, "/bin/.*", "/usr/bin/foo", false);
        assert_eq!(engine.pending_len(42), 1);
    }

    #[test]
    fn flush_drains_and_converts_to_rules() {
        let engine = LearningEngine::new();
        engine.observe(42, PolicyMode::Learn, "/bin/.*", "/usr/bin/foo", false);
        let flushed = engine.flush();
        assert_eq!(engine.pending_len(42), 0);
        let learned = flushed.get(&42).unwrap();
        let rules = to_rules("nginx-group", learned);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].group, "nginx-group");
        assert_eq!(rules[0].filter_key, "/bin/.*");
        assert_eq!(rules[0].process_path, "/usr/bin/foo");
    }

    #[test]
    fn drop_group_removes_pending_entries() {
        let engine = LearningEngine::new();
        engine.observe(42, PolicyMode::Learn, "/bin/.*", "/usr/bin/foo", false);
        engine.drop_group(42);
        assert_eq!(engine.pending_len(42), 0);
    }
}
