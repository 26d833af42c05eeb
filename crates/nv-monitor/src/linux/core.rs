//! Linux Core: wires the walker, filter engine, both kernel drivers,
//! the aggregator, classifier, learning engine, and group registry
//! into the outbound surface named in §6.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use nv_common::{FanotifyProbeData, InotifyProbeData, ProbeData, Rule};
use nv_policy::{engine, CompiledProfile, PolicyMode};

use crate::aggregator::{Aggregator, FileMod};
use crate::callbacks::{PidLookup, ReportSink, RuleSink, RuleSourceEstimator};
use crate::classifier::{self, PostEventStat};
use crate::config::{MonitorConfig, StartWatchConfig};
use crate::error::MonitorError;
use crate::learning::{self, LearningEngine};
use crate::mask;
use crate::registry::GroupRegistry;
use crate::walker::WalkerClient;

use super::fanotify_driver::{FanotifyDriver, FanotifyEvent};
use super::inotify_driver::InotifyDriver;

fn host_root(root_pid: u32) -> String {
    format!("/proc/{root_pid}/root")
}

/// Re-`lstat`s a flushed path after the aggregation window closes
/// (§4.5 "re-stats the path"), computing a content hash only for
/// regular, non-symlink files (§9 "Hashing").
fn stat_path(host_path: &str) -> PostEventStat {
    let Ok(meta) = std::fs::symlink_metadata(host_path) else {
        return PostEventStat { exists: false, is_symlink: false, inode: 0, content_hash: None };
    };
    let is_symlink = meta.file_type().is_symlink();
    let inode = {
        use std::os::unix::fs::MetadataExt;
        meta.ino()
    };
    let content_hash = if !is_symlink && meta.is_file() { hash_file(host_path) } else { None };
    PostEventStat { exists: true, is_symlink, inode, content_hash }
}

fn hash_file(host_path: &str) -> Option<u64> {
    use std::hash::{Hash, Hasher};
    let bytes = std::fs::read(host_path).ok()?;
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    Some(hasher.finish())
}

pub struct LinuxCore {
    registry: Arc<GroupRegistry>,
    aggregator: Arc<Aggregator>,
    learning: Arc<LearningEngine>,
    inotify: Arc<InotifyDriver>,
    fanotify: Arc<FanotifyDriver>,
    walker: Arc<WalkerClient>,
    pid_lookup: Arc<dyn PidLookup>,
    report_sink: Arc<dyn ReportSink>,
    rule_sink: Arc<dyn RuleSink>,
    rule_src: Arc<dyn RuleSourceEstimator>,
    config: MonitorConfig,
    n_events: AtomicU64,
    /// §6 `SetNVProtectFlag`: whether the agent's own container
    /// (`GroupInfo.is_nv_service`) still gets its events reported.
    /// Default enabled.
    protect_enabled: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LinuxCore {
    pub fn new(
        pid_lookup: Arc<dyn PidLookup>,
        report_sink: Arc<dyn ReportSink>,
        rule_sink: Arc<dyn RuleSink>,
        rule_src: Arc<dyn RuleSourceEstimator>,
        walker: Arc<WalkerClient>,
        config: MonitorConfig,
    ) -> Result<Arc<Self>, MonitorError> {
        let registry = Arc::new(GroupRegistry::new());
        let inotify = Arc::new(InotifyDriver::new()?);
        let fanotify = Arc::new(FanotifyDriver::new(pid_lookup.clone(), registry.clone())?);

        let core = Arc::new(Self {
            registry,
            aggregator: Arc::new(Aggregator::new()),
            learning: Arc::new(LearningEngine::new()),
            inotify,
            fanotify,
            walker,
            pid_lookup,
            report_sink,
            rule_sink,
            rule_src,
            config,
            n_events: AtomicU64::new(0),
            protect_enabled: AtomicBool::new(true),
            workers: Mutex::new(Vec::new()),
        });
        core.spawn_workers();
        Ok(core)
    }

    fn spawn_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock().expect("worker list mutex poisoned");
        workers.push(tokio::spawn(Self::run_inotify_reader(self.clone())));
        workers.push(tokio::spawn(Self::run_fanotify_reader(self.clone())));
        workers.push(tokio::spawn(Self::run_aggregate_ticker(self.clone())));
        workers.push(tokio::spawn(Self::run_learn_ticker(self.clone())));
    }

    async fn run_inotify_reader(self: Arc<Self>) {
        let mut stream = self.inotify.clone().listen();
        while let Some(delivery) = stream.next().await {
            let Some(resolved) = self.registry.resolve_host_path(&delivery.path) else {
                continue;
            };
            self.aggregator.record(
                &resolved.container_id,
                resolved.root_pid,
                &resolved.in_container_path,
                delivery.is_dir,
                delivery.raw_mask,
                delivery.inode_moved,
                None,
                // The inotify event structure carries no pid (unlike
                // fanotify's metadata struct): process attribution for
                // a path comes from whichever group's fanotify mark
                // also observed the same access (`FAN_OPEN`, armed for
                // `Learn`/`Evaluate` — §4.8), merged into the same
                // `FileMod` by the aggregator.
                None,
            );
        }
    }

    async fn run_fanotify_reader(self: Arc<Self>) {
        let mut stream = self.fanotify.clone().listen();
        while let Some(event) = stream.next().await {
            match event {
                FanotifyEvent::Notify(delivery) => {
                    let Some(resolved) = self.registry.resolve_host_path(&delivery.path) else {
                        continue;
                    };
                    let is_dir = std::fs::symlink_metadata(&delivery.path).map(|m| m.is_dir()).unwrap_or(false);
                    self.aggregator.record(
                        &resolved.container_id,
                        resolved.root_pid,
                        &resolved.in_container_path,
                        is_dir,
                        delivery.raw_mask,
                        false,
                        None,
                        self.pid_lookup.lookup(delivery.pid),
                    );
                }
                FanotifyEvent::Denied(delivery) => {
                    self.report_denied(delivery).await;
                }
            }
        }
    }

    async fn report_denied(&self, delivery: super::fanotify_driver::DenyDelivery) {
        let Some(resolved) = self.registry.resolve_host_path(&delivery.path) else {
            return;
        };
        let proc = self.pid_lookup.lookup(delivery.pid).unwrap_or_else(|| nv_common::ProcInfo {
            pid: delivery.pid,
            name: String::new(),
            path: String::new(),
            cmds: Vec::new(),
            euid: 0,
            euser: String::new(),
            ppid: 0,
            pname: String::new(),
            ppath: String::new(),
        });

        let Some((mode, age_secs, is_nv_service, group_name)) = self.registry.with_group(resolved.root_pid, |g| {
            let name = g.profile.matching(&resolved.in_container_path).map(|f| f.filter().derived_group.clone()).unwrap_or_default();
            (g.mode, g.age().as_secs(), g.is_nv_service, name)
        }) else {
            return;
        };
        if is_nv_service && !self.protect_enabled.load(Ordering::Relaxed) {
            return;
        }

        let file_mod = FileMod {
            container_id: resolved.container_id.clone(),
            root_pid: resolved.root_pid,
            path: resolved.in_container_path,
            is_dir: false,
            raw_mask: 0,
            inode_moved: false,
            prior_hash: None,
            procs: Vec::new(),
            first_seen: Instant::now(),
            last_seen: Instant::now(),
        };
        let stat = PostEventStat { exists: true, is_symlink: false, inode: 0, content_hash: None };
        match classifier::evaluate(&file_mod, &stat, false, true, mode, age_secs, &group_name, &delivery.container_id, Some(&proc)) {
            classifier::Verdict::Report(msg) => {
                self.n_events.fetch_add(1, Ordering::Relaxed);
                let _ = self.report_sink.send_report(msg);
            }
            classifier::Verdict::Suppressed => {}
        }
    }

    async fn run_aggregate_ticker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.aggregate_flush_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for file_mod in self.aggregator.flush() {
                self.process_flushed(file_mod);
            }
        }
    }

    fn process_flushed(&self, file_mod: FileMod) {
        let host_path = format!("{}{}", host_root(file_mod.root_pid), file_mod.path);
        let stat = stat_path(&host_path);
        let inode_moved_mask = file_mod.inode_moved;
        let previously_armed = !file_mod.has(mask::CREATE);

        let Some((mode, age_secs, is_nv_service, matched_name, recursive, customer_added_keys)) =
            self.registry.with_group(file_mod.root_pid, |g| {
                let matched = g.profile.matching(&file_mod.path);
                let name = matched.map(|f| f.filter().derived_group.clone());
                let recursive = matched.is_some_and(|f| f.filter().recursive);
                // §4.7: learning runs for *every* customer_added filter
                // whose predicate accepts the path, not just the first
                // match used for reporting.
                let customer_added_keys: Vec<String> = g
                    .profile
                    .filters()
                    .iter()
                    .filter(|f| f.filter().customer_added && f.matches(&file_mod.path))
                    .map(nv_policy::CompiledFilter::filter_key)
                    .collect();
                (g.mode, g.age().as_secs(), g.is_nv_service, name, recursive, customer_added_keys)
            })
        else {
            return;
        };
        if is_nv_service && !self.protect_enabled.load(Ordering::Relaxed) {
            return;
        }
        // No filter claims this exact path even though its group does
        // (e.g. an event on a directory mark with no per-file filter
        // match): fall back to the injected estimator rather than
        // reporting an empty group name (§6 `EstimateRuleSrc`).
        let group_name = matched_name
            .unwrap_or_else(|| self.rule_src.estimate_rule_src(&file_mod.container_id, &file_mod.path, false));

        if matches!(mode, PolicyMode::Learn) {
            for key in &customer_added_keys {
                for proc in &file_mod.procs {
                    let already_applied = self
                        .registry
                        .with_group(file_mod.root_pid, |g| {
                            g.apply_rules.get(key).is_some_and(|set| set.contains(&proc.proc.path))
                        })
                        .unwrap_or(false);
                    self.learning.observe(file_mod.root_pid, mode, key, &proc.proc.path, already_applied);
                }
            }
        }

        match classifier::evaluate(&file_mod, &stat, inode_moved_mask, previously_armed, mode, age_secs, &group_name, &file_mod.container_id, None) {
            classifier::Verdict::Report(msg) => {
                if msg.kind == nv_common::EventKind::DirCreated {
                    self.arm_newly_created_dir(file_mod.root_pid, &host_path, recursive);
                }
                self.n_events.fetch_add(1, Ordering::Relaxed);
                let _ = self.report_sink.send_report(msg);
            }
            classifier::Verdict::Suppressed => {}
        }
    }

    /// A directory created under a recursive filter isn't covered by
    /// any existing mark (§4.3/§4.4 only arm what the walk enumerated
    /// at `StartWatch` time): arm it now so a file created inside it in
    /// a later window is still observed (§8 E5).
    fn arm_newly_created_dir(&self, root_pid: u32, host_path: &str, recursive: bool) {
        if !recursive {
            return;
        }
        let mode_bundle = self.registry.with_group(root_pid, |g| g.mode_bundle).unwrap_or_default();
        if let Err(err) = self.inotify.add_monitor_dir_file(host_path) {
            tracing::debug!(path = %host_path, error = %err, "failed to arm inotify watch on newly created directory");
        }
        if let Err(err) = self.fanotify.add_monitor_dir_file(host_path, mode_bundle) {
            tracing::debug!(path = %host_path, error = %err, "failed to arm fanotify mark on newly created directory");
        }
    }

    async fn run_learn_ticker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.learn_flush_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for (root_pid, learned) in self.learning.flush() {
                self.registry.with_group_mut(root_pid, |g| {
                    for (filter_key, procs) in &learned {
                        g.learn_rules.entry(filter_key.clone()).or_default().extend(procs.iter().cloned());
                    }
                });

                let mut rules: Vec<Rule> = Vec::new();
                for (filter_key, procs) in &learned {
                    let derived_group = self
                        .registry
                        .with_group(root_pid, |g| {
                            g.profile
                                .filters()
                                .iter()
                                .find(|f| f.filter_key() == *filter_key)
                                .map(|f| f.filter().derived_group.clone())
                        })
                        .flatten()
                        .unwrap_or_default();
                    let mut single = std::collections::HashMap::new();
                    single.insert(filter_key.clone(), procs.clone());
                    rules.extend(learning::to_rules(&derived_group, &single));
                }
                if rules.is_empty() {
                    continue;
                }
                if let Err(err) = self.rule_sink.send_access_rules(rules) {
                    tracing::warn!(%root_pid, error = %err, "failed to forward learned access rules");
                }
            }
        }
    }

    /// §6 `StartWatch(id, rootPid, {profile, rule}, capBlock, isNV)`.
    pub async fn start_watch(&self, config: StartWatchConfig, id: &str, root_pid: u32) -> Result<(), MonitorError> {
        let compiled = CompiledProfile::compile(&config.profile)?;
        self.registry.start_watch(id, root_pid, compiled.clone(), config.mode, config.is_nv_service, config.cap_block, config.is_aufs);

        let walk = self.walker.walk(root_pid, compiled.walk_dirs()).await.unwrap_or_default();
        let root = host_root(root_pid);
        let targets = engine::compile(&compiled, &walk, id, &root);

        let mode_bundle = self.registry.with_group(root_pid, |g| g.mode_bundle).unwrap_or_default();
        self.fanotify.start_monitor(&root, mode_bundle).unwrap_or_else(|err| {
            tracing::warn!(%root_pid, error = %err, "failed to arm fanotify mount mark");
        });

        for target in &targets {
            if target.is_dir {
                if let Err(err) = self.inotify.add_monitor_dir_file(&target.host_path) {
                    tracing::warn!(path = %target.host_path, error = %err, "failed to arm inotify directory watch");
                }
                if let Err(err) = self.fanotify.add_monitor_dir_file(&target.host_path, mode_bundle) {
                    tracing::warn!(path = %target.host_path, error = %err, "failed to arm fanotify directory mark");
                }
            } else {
                if let Err(err) = self.inotify.add_monitor_file(&target.host_path) {
                    tracing::warn!(path = %target.host_path, error = %err, "failed to arm inotify watch");
                }
                if let Err(err) = self.fanotify.add_monitor_file(&target.host_path, mode_bundle) {
                    tracing::warn!(path = %target.host_path, error = %err, "failed to arm fanotify mark");
                }
            }
        }
        Ok(())
    }

    /// §6 `UpdateAccessRules(name, rootPid, rule)`.
    pub fn update_access_rules(&self, root_pid: u32, rules: impl IntoIterator<Item = (String, String)>) -> Result<(), MonitorError> {
        self.registry.update_access_rules(root_pid, rules)
    }

    /// §6 `ContainerCleanup(rootPid, leave)`.
    pub fn container_cleanup(&self, root_pid: u32, leave: bool) {
        let container_id = self.registry.with_group(root_pid, |g| g.container_id.clone());
        self.registry.container_cleanup(root_pid, leave);
        if leave {
            let prefix = host_root(root_pid);
            self.inotify.container_cleanup(&prefix);
            self.fanotify.container_cleanup(&prefix);
            self.learning.drop_group(root_pid);
            if let Some(container_id) = container_id {
                self.aggregator.drop_container(&container_id);
            }
        }
    }

    /// §6 `GetWatchFileList(rootPid)`.
    #[must_use]
    pub fn watch_file_list(&self, root_pid: u32) -> Vec<String> {
        let prefix = host_root(root_pid);
        let mut paths = self.fanotify.watch_file_list(&prefix);
        paths.extend(self.inotify.watch_file_list(&prefix));
        paths.sort();
        paths.dedup();
        paths
    }

    /// §6 `GetAllFileMonitorFile()`.
    #[must_use]
    pub fn all_file_monitor_files(&self) -> Vec<String> {
        self.fanotify.get_watches()
    }

    /// §6 `GetProbeData()`.
    #[must_use]
    pub fn probe_data(&self) -> ProbeData {
        let (roots, mnt_roots, dir_marks, fan_paths) = self.fanotify.probe_counts();
        let (wds, ino_paths, ino_dirs) = self.inotify.probe_counts();
        ProbeData {
            n_events: self.n_events.load(Ordering::Relaxed),
            n_groups: self.registry.len(),
            fanotify: FanotifyProbeData {
                roots,
                mnt_roots,
                dir_marks,
                rules: self.registry.total_apply_rules(),
                paths: fan_paths,
                dirs: dir_marks,
            },
            inotify: InotifyProbeData { wds, paths: ino_paths, dirs: ino_dirs },
        }
    }

    /// §6 `SetMonitorTrace(enable, logLevel)`. The actual subscriber is
    /// owned by the embedding binary (§B.2 "library discipline"); this
    /// only emits a structured marker event other layers can filter on.
    pub fn set_monitor_trace(&self, enable: bool, log_level: &str) {
        tracing::info!(enable, log_level, "monitor trace toggled");
    }

    /// §6 `SetNVProtectFlag(enable)`.
    pub fn set_nv_protect_flag(&self, enable: bool) {
        self.protect_enabled.store(enable, Ordering::Relaxed);
    }

    /// §6 `Close()`. Idempotent: aborting an already-finished task is a
    /// no-op (§5 "`Close()` is idempotent").
    pub fn close(&self) {
        let mut workers = self.workers.lock().expect("worker list mutex poisoned");
        for handle in workers.drain(..) {
            handle.abort();
        }
    }
}
