//! Container file-integrity and access-control monitor core.
//!
//! Walks a container's filesystem (C1), compiles a declarative
//! [`Profile`] against that walk into concrete watch targets (C2),
//! arms inotify/fanotify watches for them (C3/C4), aggregates and
//! classifies the resulting kernel events (C5/C6), and reports
//! violations plus learned access rules (C7) through callbacks the
//! caller injects at construction time (C8 owns the per-container
//! state backing all of it). [`Monitor`] is the only public entry
//! point; everything else in this crate is wiring.

mod aggregator;
mod callbacks;
mod classifier;
mod config;
mod error;
mod learning;
#[cfg(target_os = "linux")]
mod linux;
mod mask;
mod registry;
mod walker;

use std::sync::Arc;

pub use callbacks::{PidLookup, ReportSink, RuleSink, RuleSourceEstimator};
pub use config::{MonitorConfig, StartWatchConfig};
pub use error::{DriverError, MonitorError, WalkerError};
pub use walker::{RawWalkResult, Walker, WalkerClient};

pub use nv_common::{
    Action, EventKind, FanotifyProbeData, InotifyProbeData, MonitorMessage, ProbeData, ProcInfo, Rule,
};
pub use nv_policy::{Behavior, Filter, PolicyMode, Profile};

#[cfg(target_os = "linux")]
use linux::LinuxCore;

/// Public facade over the kernel-coupled monitor core (§1, §6). On any
/// build where `target_os` isn't `linux` every method is a no-op or
/// returns [`MonitorError::NotSupported`] — there is no notification
/// channel to back it (§7 "kernel-unsupported").
pub struct Monitor {
    #[cfg(target_os = "linux")]
    inner: Arc<LinuxCore>,

    #[cfg(not(target_os = "linux"))]
    _stub: (),
}

impl Monitor {
    /// Opens both kernel channels and spawns the background workers
    /// (§5: inotify reader, fanotify reader, aggregate ticker, learn
    /// ticker). `pid_lookup`/`report_sink`/`rule_sink`/`rule_src` are
    /// the four injected collaborators named in §6; `walker` is
    /// already wrapped in its timeout/concurrency cap.
    pub fn new(
        pid_lookup: Arc<dyn PidLookup>,
        report_sink: Arc<dyn ReportSink>,
        rule_sink: Arc<dyn RuleSink>,
        rule_src: Arc<dyn RuleSourceEstimator>,
        walker: Arc<WalkerClient>,
        config: MonitorConfig,
    ) -> Result<Self, MonitorError> {
        #[cfg(target_os = "linux")]
        {
            let inner = LinuxCore::new(pid_lookup, report_sink, rule_sink, rule_src, walker, config)?;
            Ok(Self { inner })
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = (pid_lookup, report_sink, rule_sink, rule_src, walker, config);
            Err(MonitorError::NotSupported)
        }
    }

    /// §6 `StartWatch(id, rootPid, {profile, rule}, capBlock, isNV)`.
    pub async fn start_watch(&self, config: StartWatchConfig, id: &str, root_pid: u32) -> Result<(), MonitorError> {
        #[cfg(target_os = "linux")]
        return self.inner.start_watch(config, id, root_pid).await;

        #[cfg(not(target_os = "linux"))]
        {
            let _ = (config, id, root_pid);
            Err(MonitorError::NotSupported)
        }
    }

    /// §6 `UpdateAccessRules(name, rootPid, rule)`.
    pub fn update_access_rules(
        &self,
        root_pid: u32,
        rules: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), MonitorError> {
        #[cfg(target_os = "linux")]
        return self.inner.update_access_rules(root_pid, rules);

        #[cfg(not(target_os = "linux"))]
        {
            let _ = (root_pid, rules);
            Err(MonitorError::NotSupported)
        }
    }

    /// §6 `ContainerCleanup(rootPid, leave)`.
    pub fn container_cleanup(&self, root_pid: u32, leave: bool) {
        #[cfg(target_os = "linux")]
        self.inner.container_cleanup(root_pid, leave);

        #[cfg(not(target_os = "linux"))]
        let _ = (root_pid, leave);
    }

    /// §6 `GetWatchFileList(rootPid)`.
    #[must_use]
    pub fn watch_file_list(&self, root_pid: u32) -> Vec<String> {
        #[cfg(target_os = "linux")]
        return self.inner.watch_file_list(root_pid);

        #[cfg(not(target_os = "linux"))]
        {
            let _ = root_pid;
            Vec::new()
        }
    }

    /// §6 `GetAllFileMonitorFile()`.
    #[must_use]
    pub fn all_file_monitor_files(&self) -> Vec<String> {
        #[cfg(target_os = "linux")]
        return self.inner.all_file_monitor_files();

        #[cfg(not(target_os = "linux"))]
        Vec::new()
    }

    /// §6 `GetProbeData()`.
    #[must_use]
    pub fn probe_data(&self) -> ProbeData {
        #[cfg(target_os = "linux")]
        return self.inner.probe_data();

        #[cfg(not(target_os = "linux"))]
        ProbeData::default()
    }

    /// §6 `SetMonitorTrace(enable, logLevel)`.
    pub fn set_monitor_trace(&self, enable: bool, log_level: &str) {
        #[cfg(target_os = "linux")]
        self.inner.set_monitor_trace(enable, log_level);

        #[cfg(not(target_os = "linux"))]
        let _ = (enable, log_level);
    }

    /// §6 `SetNVProtectFlag(enable)`.
    pub fn set_nv_protect_flag(&self, enable: bool) {
        #[cfg(target_os = "linux")]
        self.inner.set_nv_protect_flag(enable);

        #[cfg(not(target_os = "linux"))]
        let _ = enable;
    }

    /// §6 `Close()`. Idempotent: a second call is a no-op (§5).
    pub fn close(&self) {
        #[cfg(target_os = "linux")]
        self.inner.close();
    }
}
